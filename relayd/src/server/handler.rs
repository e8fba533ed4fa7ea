//! Per-worker connection handler.
//!
//! Owns the worker's listeners and its list of live connections. Every
//! accepted connection gets a filter chain from the listener's factory, a
//! stats bundle keyed by the listener address, and a lifetime span; a
//! terminal event unlinks it and schedules deferred deletion so teardown
//! never runs under one of the connection's own callbacks.
//!
//! The watchdog heartbeat lives here too: a 100 ms timer samples wall-clock
//! drift and counts loop stalls, catching a wedged worker without needing a
//! second thread.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use relayd_net::event::{Dispatcher, Timer};
use relayd_net::tls::ServerTlsContext;
use relayd_net::{
    CloseType, Connection, ConnectionCallbacks, ConnectionEvent, ConnectionHandler,
    FilterChainFactory, Listener, ListenerCallbacks, ListenerOptions, ListenSocket, State,
};
use relayd_stats::{Counter, Gauge, Store, TimerStat, Timespan};

const WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const WATCHDOG_MISS: Duration = Duration::from_millis(200);
const WATCHDOG_MEGA_MISS: Duration = Duration::from_millis(1000);

/// Per-listener stat bundle, prefixed `listener.<address>.`.
#[derive(Clone)]
struct ListenerStats {
    downstream_cx_total: Counter,
    downstream_cx_active: Gauge,
    downstream_cx_destroy: Counter,
    downstream_cx_length_ms: TimerStat,
}

impl ListenerStats {
    fn new(scope: &relayd_stats::Scope) -> ListenerStats {
        ListenerStats {
            downstream_cx_total: scope.counter("downstream_cx_total"),
            downstream_cx_active: scope.gauge("downstream_cx_active"),
            downstream_cx_destroy: scope.counter("downstream_cx_destroy"),
            downstream_cx_length_ms: scope.timer("downstream_cx_length_ms"),
        }
    }
}

/// One configured listener: the accepting handle, its filter chain factory,
/// and its stats.
struct ActiveListener {
    handler: Weak<ConnectionHandlerImpl>,
    factory: Rc<dyn FilterChainFactory>,
    stats: ListenerStats,
    listener: RefCell<Option<Listener>>,
}

impl ListenerCallbacks for ActiveListener {
    fn on_new_connection(&self, connection: Connection) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_new_connection(self, connection);
        }
    }
}

/// One admitted connection on the handler's list. Stats and the lifetime
/// span resolve in `Drop`, which runs deferred.
struct ActiveConnection {
    handler: Weak<ConnectionHandlerImpl>,
    connection: Connection,
    stats: ListenerStats,
    span: RefCell<Option<Timespan>>,
    removed: Cell<bool>,
}

impl ConnectionCallbacks for ActiveConnection {
    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::LocalClose | ConnectionEvent::RemoteClose => {
                if let Some(handler) = self.handler.upgrade() {
                    handler.remove_connection(self);
                }
            }
            ConnectionEvent::Connected => {}
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.stats.downstream_cx_active.dec();
        self.stats.downstream_cx_destroy.inc();
        if let Some(span) = self.span.borrow_mut().take() {
            span.complete();
        }
    }
}

pub struct ConnectionHandlerImpl {
    dispatcher: Rc<Dispatcher>,
    store: Store,
    listeners: RefCell<Vec<(SocketAddr, Rc<ActiveListener>)>>,
    connections: RefCell<Vec<Rc<ActiveConnection>>>,
    num_connections: Cell<u64>,
    total_connections: Gauge,
    watchdog_miss: Counter,
    watchdog_mega_miss: Counter,
    watchdog_timer: RefCell<Option<Timer>>,
    last_watchdog_time: Cell<Instant>,
}

impl ConnectionHandlerImpl {
    pub fn new(dispatcher: Rc<Dispatcher>, store: Store) -> Rc<ConnectionHandlerImpl> {
        let watchdog_miss = store.counter("server.watchdog_miss");
        let watchdog_mega_miss = store.counter("server.watchdog_mega_miss");
        let total_connections = store.gauge("server.total_connections");
        Rc::new(ConnectionHandlerImpl {
            dispatcher,
            store,
            listeners: RefCell::new(Vec::new()),
            connections: RefCell::new(Vec::new()),
            num_connections: Cell::new(0),
            total_connections,
            watchdog_miss,
            watchdog_mega_miss,
            watchdog_timer: RefCell::new(None),
            last_watchdog_time: Cell::new(Instant::now()),
        })
    }

    pub fn dispatcher(&self) -> &Rc<Dispatcher> {
        &self.dispatcher
    }

    pub fn num_connections(&self) -> u64 {
        self.num_connections.get()
    }

    pub fn add_listener(
        self: &Rc<Self>,
        factory: Rc<dyn FilterChainFactory>,
        socket: std::sync::Arc<ListenSocket>,
        options: ListenerOptions,
        tls: Option<ServerTlsContext>,
    ) -> Result<(), relayd_net::Error> {
        let address = socket.local_address();
        let scope = self.store.scope(&format!("listener.{address}."));

        let active = Rc::new(ActiveListener {
            handler: Rc::downgrade(self),
            factory,
            stats: ListenerStats::new(&scope),
            listener: RefCell::new(None),
        });

        let handler_dyn: Rc<dyn ConnectionHandler> = self.clone();
        let callbacks_dyn: Rc<dyn ListenerCallbacks> = active.clone();
        let listener = Listener::new(
            &self.dispatcher,
            Rc::downgrade(&handler_dyn),
            socket,
            Rc::downgrade(&callbacks_dyn),
            &scope,
            options,
            tls,
        )?;

        *active.listener.borrow_mut() = Some(listener);
        self.listeners.borrow_mut().push((address, active));
        Ok(())
    }

    fn on_new_connection(self: &Rc<Self>, listener: &ActiveListener, connection: Connection) {
        debug!(conn_id = connection.id(),
               remote = %connection.remote_address(), "new connection");

        let empty_filter_chain = !listener.factory.create_filter_chain(&connection);

        // The TLS setup may already have failed underneath us.
        if connection.state() == State::Closed {
            return;
        }

        if empty_filter_chain {
            debug!(conn_id = connection.id(), "closing connection: no filters");
            connection.close(CloseType::NoFlush);
            return;
        }

        connection.set_no_delay(true);

        let active = Rc::new(ActiveConnection {
            handler: Rc::downgrade(self),
            connection: connection.clone(),
            stats: listener.stats.clone(),
            span: RefCell::new(Some(listener.stats.downstream_cx_length_ms.span())),
            removed: Cell::new(false),
        });

        listener.stats.downstream_cx_total.inc();
        listener.stats.downstream_cx_active.inc();
        self.total_connections.inc();
        self.num_connections.set(self.num_connections.get() + 1);
        self.connections.borrow_mut().push(active.clone());

        connection.add_connection_callbacks(active);
        connection.init_filters();
    }

    fn remove_connection(&self, connection: &ActiveConnection) {
        if connection.removed.replace(true) {
            return;
        }
        debug!(conn_id = connection.connection.id(), "adding to cleanup list");

        let removed: Vec<Rc<ActiveConnection>> = {
            let mut connections = self.connections.borrow_mut();
            let (keep, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut *connections)
                .into_iter()
                .partition(|c| !std::ptr::eq(c.as_ref(), connection));
            *connections = keep;
            gone
        };

        self.num_connections.set(self.num_connections.get() - 1);
        self.total_connections.dec();
        for active in removed {
            self.dispatcher.deferred_delete(Box::new(active));
        }
    }

    /// Detect event-loop stalls: a 100 ms heartbeat whose observed period
    /// stretching past the thresholds increments the miss counters.
    pub fn start_watchdog(self: &Rc<Self>) {
        let weak = Rc::downgrade(self);
        let timer = self.dispatcher.create_timer(move || {
            if let Some(handler) = weak.upgrade() {
                handler.on_watchdog_tick();
            }
        });
        timer.enable_timer(WATCHDOG_INTERVAL);
        self.last_watchdog_time.set(Instant::now());
        *self.watchdog_timer.borrow_mut() = Some(timer);
    }

    fn on_watchdog_tick(&self) {
        let delta = self.last_watchdog_time.get().elapsed();
        if delta > WATCHDOG_MISS {
            self.watchdog_miss.inc();
        }
        if delta > WATCHDOG_MEGA_MISS {
            self.watchdog_mega_miss.inc();
        }
        self.last_watchdog_time.set(Instant::now());
        if let Some(timer) = self.watchdog_timer.borrow().as_ref() {
            timer.enable_timer(WATCHDOG_INTERVAL);
        }
    }

    /// Close every live connection without flushing, then run the deferred
    /// teardown synchronously. Shutdown path.
    pub fn close_connections(&self) {
        loop {
            let next = self.connections.borrow().first().cloned();
            match next {
                Some(active) if active.connection.state() == State::Closed => {
                    // Terminal event already consumed elsewhere; unlink.
                    self.remove_connection(&active);
                }
                Some(active) => active.connection.close(CloseType::NoFlush),
                None => break,
            }
        }
        self.dispatcher.clear_deferred_delete_list();
    }

    /// Stop accepting everywhere; existing connections are untouched.
    pub fn close_listeners(&self) {
        info!("closing and draining listeners");
        for (_, active) in self.listeners.borrow().iter() {
            active.listener.borrow_mut().take();
        }
    }
}

impl ConnectionHandler for ConnectionHandlerImpl {
    /// Exact IP:port match first, then the wildcard listener on the same
    /// port. Linear scan; listener counts are configuration-bounded.
    fn find_listener_by_address(&self, address: SocketAddr) -> Option<Listener> {
        let listeners = self.listeners.borrow();
        if let Some((_, active)) = listeners.iter().find(|(addr, _)| *addr == address) {
            return active.listener.borrow().clone();
        }
        listeners
            .iter()
            .find(|(addr, _)| addr.ip().is_unspecified() && addr.port() == address.port())
            .and_then(|(_, active)| active.listener.borrow().clone())
    }
}
