//! HTTP/1 upstream connection pool.
//!
//! The pool multiplexes request streams over a bounded set of persistent
//! upstream connections, each wrapped in a codec client that carries at most
//! one stream at a time. Admission follows a strict order: an idle client
//! binds immediately; below the connection limit the request queues and at
//! most one connect is kept in flight; below the pending limit the request
//! queues without a new connection; beyond both the caller fails
//! synchronously. Pending requests bind to freed clients in FIFO order.
//!
//! Clients counted against `max_connections` include those still
//! connecting, so `ready + busy` never exceeds the limit.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, trace};

use relayd_net::event::{Dispatcher, Timer};
use relayd_net::filter::{ConnectionOps, FilterStatus, ReadFilter};
use relayd_net::{CloseType, Connection, ConnectionCallbacks, ConnectionEvent};
use relayd_stats::{Counter, Gauge, Scope, TimerStat, Timespan};

use crate::codec::{
    encode_request_head, ParseOutcome, RequestHead, ResponseDecoderSharedPtr, ResponseParser,
};

/// Per-host pool limits and knobs.
#[derive(Debug, Clone)]
pub struct ConnPoolConfig {
    pub max_connections: usize,
    pub max_pending_requests: usize,
    /// Zero disables the per-connection request cap.
    pub max_requests_per_connection: u64,
    pub connect_timeout: Duration,
    /// Read watermark for upstream connections; zero keeps the default.
    pub per_connection_buffer_limit_bytes: usize,
}

impl Default for ConnPoolConfig {
    fn default() -> ConnPoolConfig {
        ConnPoolConfig {
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests_per_connection: 0,
            connect_timeout: Duration::from_secs(5),
            per_connection_buffer_limit_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    /// Pending-request limit hit; failed synchronously.
    Overflow,
    /// The upstream connect failed or timed out.
    ConnectionFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResetReason {
    /// The upstream connection died while the stream was bound to it.
    ConnectionTermination,
}

/// Caller interface handed to [`ConnPool::new_stream`].
pub trait PoolCallbacks {
    fn on_pool_ready(&self, encoder: StreamEncoder);
    fn on_pool_failure(&self, reason: PoolFailureReason);
}

/// Observer for a bound stream's abnormal termination.
pub trait StreamCallbacks {
    fn on_reset_stream(&self, reason: StreamResetReason);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Connecting,
    Ready,
    Busy,
    /// Finishing its current response, then closing.
    Draining,
    Closed,
}

struct BoundStream {
    decoder: ResponseDecoderSharedPtr,
    stream_callbacks: Vec<Rc<dyn StreamCallbacks>>,
}

struct ActiveClient {
    connection: Connection,
    parser: ResponseParser,
    state: ClientState,
    connect_timer: Option<Timer>,
    connect_span: Option<Timespan>,
    length_span: Option<Timespan>,
    bound: Option<BoundStream>,
    total_requests: u64,
    destroyed: bool,
}

type ClientPtr = Rc<RefCell<ActiveClient>>;

struct PendingRequest {
    decoder: ResponseDecoderSharedPtr,
    callbacks: Rc<dyn PoolCallbacks>,
    /// Filled in at bind time so a late cancel can find its client.
    bound_client: Rc<RefCell<Option<Weak<RefCell<ActiveClient>>>>>,
}

type PendingRequestPtr = Rc<RefCell<PendingRequest>>;

/// Handle for cancelling a queued request before it binds.
pub struct Cancellable {
    pool: Weak<PoolInner>,
    request: Weak<RefCell<PendingRequest>>,
    /// Set once the request binds; cancel then closes this client instead of
    /// dequeueing.
    bound_client: Rc<RefCell<Option<Weak<RefCell<ActiveClient>>>>>,
}

impl Cancellable {
    /// O(1); after this the caller's callbacks will never be invoked.
    pub fn cancel(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if let Some(request) = self.request.upgrade() {
            if (ConnPool { inner: pool.clone() }).remove_pending(&request) {
                pool.stats.rq_pending_active.dec();
                ConnPool { inner: pool }.check_for_drained();
                return;
            }
        }
        // Already bound through an in-flight connect; drop the binding by
        // closing the client.
        if let Some(client) = self.bound_client.borrow().as_ref().and_then(Weak::upgrade) {
            let connection = client.borrow().connection.clone();
            connection.close(CloseType::NoFlush);
        }
    }
}

struct PoolStats {
    cx_total: Counter,
    cx_active: Gauge,
    cx_connect_fail: Counter,
    cx_connect_timeout: Counter,
    cx_overflow: Counter,
    cx_max_requests: Counter,
    cx_destroy: Counter,
    cx_destroy_with_active_rq: Counter,
    cx_connect_ms: TimerStat,
    cx_length_ms: TimerStat,
    rq_total: Counter,
    rq_active: Gauge,
    rq_pending_total: Counter,
    rq_pending_active: Gauge,
    rq_pending_overflow: Counter,
    rq_pending_failure_eject: Counter,
}

impl PoolStats {
    fn new(scope: &Scope) -> PoolStats {
        PoolStats {
            cx_total: scope.counter("upstream_cx_total"),
            cx_active: scope.gauge("upstream_cx_active"),
            cx_connect_fail: scope.counter("upstream_cx_connect_fail"),
            cx_connect_timeout: scope.counter("upstream_cx_connect_timeout"),
            cx_overflow: scope.counter("upstream_cx_overflow"),
            cx_max_requests: scope.counter("upstream_cx_max_requests"),
            cx_destroy: scope.counter("upstream_cx_destroy"),
            cx_destroy_with_active_rq: scope.counter("upstream_cx_destroy_with_active_rq"),
            cx_connect_ms: scope.timer("upstream_cx_connect_ms"),
            cx_length_ms: scope.timer("upstream_cx_length_ms"),
            rq_total: scope.counter("upstream_rq_total"),
            rq_active: scope.gauge("upstream_rq_active"),
            rq_pending_total: scope.counter("upstream_rq_pending_total"),
            rq_pending_active: scope.gauge("upstream_rq_pending_active"),
            rq_pending_overflow: scope.counter("upstream_rq_pending_overflow"),
            rq_pending_failure_eject: scope.counter("upstream_rq_pending_failure_eject"),
        }
    }
}

struct PoolInner {
    dispatcher: Rc<Dispatcher>,
    host: SocketAddr,
    config: ConnPoolConfig,
    stats: PoolStats,
    ready_clients: RefCell<Vec<ClientPtr>>,
    busy_clients: RefCell<Vec<ClientPtr>>,
    pending_requests: RefCell<VecDeque<PendingRequestPtr>>,
    drained_callbacks: RefCell<Vec<Rc<dyn Fn()>>>,
    draining_check: std::cell::Cell<bool>,
}

/// HTTP/1 connection pool for one upstream host.
#[derive(Clone)]
pub struct ConnPool {
    inner: Rc<PoolInner>,
}

impl ConnPool {
    pub fn new(
        dispatcher: &Rc<Dispatcher>,
        host: SocketAddr,
        scope: &Scope,
        config: ConnPoolConfig,
    ) -> ConnPool {
        let inner = Rc::new(PoolInner {
            dispatcher: Rc::clone(dispatcher),
            host,
            config,
            stats: PoolStats::new(scope),
            ready_clients: RefCell::new(Vec::new()),
            busy_clients: RefCell::new(Vec::new()),
            pending_requests: RefCell::new(VecDeque::new()),
            drained_callbacks: RefCell::new(Vec::new()),
            draining_check: std::cell::Cell::new(false),
        });
        ConnPool { inner }
    }

    /// Ask for a stream. Returns `None` when the caller's callbacks already
    /// fired synchronously (immediate bind or failure); otherwise a handle
    /// that stays cancellable until the request binds.
    pub fn new_stream(
        &self,
        decoder: ResponseDecoderSharedPtr,
        callbacks: Rc<dyn PoolCallbacks>,
    ) -> Option<Cancellable> {
        // Idle client: bind without queueing.
        let ready = self.inner.ready_clients.borrow_mut().pop();
        if let Some(client) = ready {
            trace!(host = %self.inner.host, "using existing connection");
            self.inner.busy_clients.borrow_mut().push(client.clone());
            let request = Rc::new(RefCell::new(PendingRequest {
                decoder,
                callbacks,
                bound_client: Rc::new(RefCell::new(None)),
            }));
            self.attach_request_to_client(&client, &request);
            return None;
        }

        let busy_len = self.inner.busy_clients.borrow().len();
        let connecting = self.connecting_count();

        if busy_len < self.inner.config.max_connections {
            let request = self.enqueue(decoder, callbacks);
            if connecting == 0 && !self.create_client() {
                return None; // creation failure already failed the request
            }
            Some(self.handle_for(&request))
        } else if self
            .inner
            .pending_requests
            .borrow()
            .len()
            .saturating_sub(connecting)
            < self.inner.config.max_pending_requests
        {
            // All connections occupied; queue and wait for one to free up.
            self.inner.stats.cx_overflow.inc();
            let request = self.enqueue(decoder, callbacks);
            Some(self.handle_for(&request))
        } else {
            debug!(host = %self.inner.host, "max pending requests overflow");
            self.inner.stats.rq_pending_overflow.inc();
            callbacks.on_pool_failure(PoolFailureReason::Overflow);
            None
        }
    }

    /// Register a callback fired whenever the pool becomes empty of clients
    /// and pending requests; fires immediately if it already is. While any
    /// drained callback is registered the pool recycles nothing: response
    /// completion closes its client.
    pub fn add_drained_callback(&self, cb: impl Fn() + 'static) {
        self.inner.drained_callbacks.borrow_mut().push(Rc::new(cb));
        // Clients already carrying a request finish it and then retire.
        for client in self.inner.busy_clients.borrow().iter() {
            let mut c = client.borrow_mut();
            if c.state == ClientState::Busy {
                c.state = ClientState::Draining;
            }
        }
        self.check_for_drained();
    }

    /// Immediate shutdown path: close every client, idle or busy.
    pub fn close_connections(&self) {
        let clients: Vec<ClientPtr> = self
            .inner
            .ready_clients
            .borrow()
            .iter()
            .chain(self.inner.busy_clients.borrow().iter())
            .cloned()
            .collect();
        for client in clients {
            let connection = client.borrow().connection.clone();
            connection.close(CloseType::NoFlush);
        }
    }

    fn enqueue(
        &self,
        decoder: ResponseDecoderSharedPtr,
        callbacks: Rc<dyn PoolCallbacks>,
    ) -> PendingRequestPtr {
        self.inner.stats.rq_pending_total.inc();
        self.inner.stats.rq_pending_active.inc();
        let request = Rc::new(RefCell::new(PendingRequest {
            decoder,
            callbacks,
            bound_client: Rc::new(RefCell::new(None)),
        }));
        self.inner
            .pending_requests
            .borrow_mut()
            .push_back(request.clone());
        request
    }

    fn handle_for(&self, request: &PendingRequestPtr) -> Cancellable {
        Cancellable {
            pool: Rc::downgrade(&self.inner),
            request: Rc::downgrade(request),
            bound_client: request.borrow().bound_client.clone(),
        }
    }

    fn connecting_count(&self) -> usize {
        self.inner
            .busy_clients
            .borrow()
            .iter()
            .filter(|c| c.borrow().state == ClientState::Connecting)
            .count()
    }

    fn remove_pending(&self, request: &PendingRequestPtr) -> bool {
        let mut pending = self.inner.pending_requests.borrow_mut();
        let before = pending.len();
        pending.retain(|r| !Rc::ptr_eq(r, request));
        before != pending.len()
    }

    /// Open one upstream connection and park it in the busy list as
    /// connecting. Returns false when the connect fails synchronously, in
    /// which case the head pending request has been failed.
    fn create_client(&self) -> bool {
        trace!(host = %self.inner.host, "creating a new connection");

        let connection = match Connection::connect(&self.inner.dispatcher, self.inner.host) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(host = %self.inner.host, error = %e, "upstream connect failed");
                self.inner.stats.cx_connect_fail.inc();
                self.fail_head_pending(PoolFailureReason::ConnectionFailure, true);
                return false;
            }
        };

        self.inner.stats.cx_total.inc();
        self.inner.stats.cx_active.inc();
        connection.set_no_delay(true);
        if self.inner.config.per_connection_buffer_limit_bytes != 0 {
            connection.set_read_buffer_limit(self.inner.config.per_connection_buffer_limit_bytes);
        }

        let client = Rc::new(RefCell::new(ActiveClient {
            connection: connection.clone(),
            parser: ResponseParser::default(),
            state: ClientState::Connecting,
            connect_timer: None,
            connect_span: Some(self.inner.stats.cx_connect_ms.span()),
            length_span: Some(self.inner.stats.cx_length_ms.span()),
            bound: None,
            total_requests: 0,
            destroyed: false,
        }));

        let pool_weak = Rc::downgrade(&self.inner);
        let client_weak = Rc::downgrade(&client);
        let timer = self.inner.dispatcher.create_timer(move || {
            if let (Some(pool), Some(client)) = (pool_weak.upgrade(), client_weak.upgrade()) {
                ConnPool { inner: pool }.on_connect_timeout(&client);
            }
        });
        timer.enable_timer(self.inner.config.connect_timeout);
        client.borrow_mut().connect_timer = Some(timer);

        connection.add_connection_callbacks(Rc::new(ClientConnectionCallbacks {
            pool: Rc::downgrade(&self.inner),
            client: Rc::downgrade(&client),
        }));
        connection.add_read_filter(Box::new(ClientReadFilter {
            pool: Rc::downgrade(&self.inner),
            client: Rc::downgrade(&client),
        }));

        self.inner.busy_clients.borrow_mut().push(client);
        true
    }

    fn attach_request_to_client(&self, client: &ClientPtr, request: &PendingRequestPtr) {
        self.inner.stats.rq_total.inc();
        self.inner.stats.rq_active.inc();

        let callbacks = {
            let mut c = client.borrow_mut();
            c.state = ClientState::Busy;
            c.total_requests += 1;
            c.bound = Some(BoundStream {
                decoder: request.borrow().decoder.clone(),
                stream_callbacks: Vec::new(),
            });
            request.borrow().callbacks.clone()
        };
        *request.borrow().bound_client.borrow_mut() = Some(Rc::downgrade(client));

        let encoder = StreamEncoder {
            client: Rc::downgrade(client),
        };
        callbacks.on_pool_ready(encoder);
    }

    /// Pop the queue head and fail it. `eject` selects the
    /// pending-failure-eject counter (connect failures and timeouts).
    fn fail_head_pending(&self, reason: PoolFailureReason, eject: bool) {
        let head = self.inner.pending_requests.borrow_mut().pop_front();
        if let Some(request) = head {
            self.inner.stats.rq_pending_active.dec();
            if eject {
                self.inner.stats.rq_pending_failure_eject.inc();
            }
            let callbacks = request.borrow().callbacks.clone();
            callbacks.on_pool_failure(reason);
        }
    }

    fn on_connect_timeout(&self, client: &ClientPtr) {
        if client.borrow().state != ClientState::Connecting {
            return;
        }

        debug!(host = %self.inner.host, "connect timeout");
        self.inner.stats.cx_connect_fail.inc();
        self.inner.stats.cx_connect_timeout.inc();

        // Drop out of the accounting before the failure callback runs so a
        // caller issuing a new stream inside it can start a fresh connect.
        self.remove_client(client);
        client.borrow_mut().state = ClientState::Closed;

        self.fail_head_pending(PoolFailureReason::ConnectionFailure, true);

        let connection = client.borrow().connection.clone();
        connection.close(CloseType::NoFlush);
        self.maybe_create_for_pending();
    }

    fn on_connection_event(&self, client: &ClientPtr, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(client),
            ConnectionEvent::LocalClose | ConnectionEvent::RemoteClose => {
                self.on_closed(client);
            }
        }
    }

    fn on_connected(&self, client: &ClientPtr) {
        {
            let mut c = client.borrow_mut();
            if c.state != ClientState::Connecting {
                return;
            }
            // Idempotent with a same-tick timeout: the timer dies first.
            if let Some(timer) = c.connect_timer.take() {
                timer.disable();
            }
            if let Some(span) = c.connect_span.take() {
                span.complete();
            }
            c.state = ClientState::Ready;
        }

        let head = self.inner.pending_requests.borrow_mut().pop_front();
        match head {
            Some(request) => {
                self.inner.stats.rq_pending_active.dec();
                // Stays on the busy list it was parked on while connecting.
                self.attach_request_to_client(client, &request);
            }
            None => {
                self.remove_from(&self.inner.busy_clients, client);
                self.inner.ready_clients.borrow_mut().push(client.clone());
            }
        }

        self.maybe_create_for_pending();
    }

    fn on_closed(&self, client: &ClientPtr) {
        let state = client.borrow().state;
        match state {
            ClientState::Connecting => {
                // Remote close before the connect finished.
                self.inner.stats.cx_connect_fail.inc();
                self.remove_client(client);
                {
                    let mut c = client.borrow_mut();
                    c.state = ClientState::Closed;
                    if let Some(timer) = c.connect_timer.take() {
                        timer.disable();
                    }
                }
                self.fail_head_pending(PoolFailureReason::ConnectionFailure, true);
                self.finalize_destroy(client);
                self.maybe_create_for_pending();
            }

            ClientState::Busy | ClientState::Draining => {
                self.remove_client(client);
                let bound = {
                    let mut c = client.borrow_mut();
                    c.state = ClientState::Closed;
                    c.bound.take()
                };
                if let Some(bound) = bound {
                    self.inner.stats.rq_active.dec();
                    // A close-delimited response body completes on close;
                    // anything else is a mid-request termination.
                    let completed = client
                        .borrow_mut()
                        .parser
                        .complete_on_close(Some(&bound.decoder));
                    if !completed {
                        self.inner.stats.cx_destroy_with_active_rq.inc();
                        for cb in &bound.stream_callbacks {
                            cb.on_reset_stream(StreamResetReason::ConnectionTermination);
                        }
                    }
                }
                self.finalize_destroy(client);
                self.maybe_create_for_pending();
            }

            ClientState::Ready => {
                self.remove_client(client);
                client.borrow_mut().state = ClientState::Closed;
                self.finalize_destroy(client);
            }

            // Timeout and drain paths already took the client out of the
            // accounting; only the teardown remains.
            ClientState::Closed => self.finalize_destroy(client),
        }
    }

    /// Response finished on a busy client: recycle or close, then hand the
    /// freed capacity to the queue. Runs inside the connection's filter
    /// dispatch, hence the `ops` escape hatch for closing.
    fn on_response_complete(
        &self,
        client: &ClientPtr,
        connection_close: bool,
        ops: &mut dyn ConnectionOps,
    ) {
        trace!(host = %self.inner.host, "response complete");
        self.inner.stats.rq_active.dec();

        let (hit_max_requests, draining) = {
            let mut c = client.borrow_mut();
            c.bound = None;
            let max = self.inner.config.max_requests_per_connection;
            (
                max != 0 && c.total_requests >= max,
                c.state == ClientState::Draining,
            )
        };
        let drain_mode = !self.inner.drained_callbacks.borrow().is_empty();

        if connection_close || hit_max_requests || draining || drain_mode {
            if hit_max_requests {
                self.inner.stats.cx_max_requests.inc();
            }
            self.remove_client(client);
            client.borrow_mut().state = ClientState::Closed;
            ops.close(CloseType::NoFlush);
        } else {
            client.borrow_mut().state = ClientState::Ready;
            let head = self.inner.pending_requests.borrow_mut().pop_front();
            match head {
                Some(request) => {
                    self.inner.stats.rq_pending_active.dec();
                    self.attach_request_to_client(client, &request);
                }
                None => {
                    self.remove_from(&self.inner.busy_clients, client);
                    self.inner.ready_clients.borrow_mut().push(client.clone());
                }
            }
        }

        self.check_for_drained();
    }

    fn remove_client(&self, client: &ClientPtr) {
        self.remove_from(&self.inner.busy_clients, client);
        self.remove_from(&self.inner.ready_clients, client);
    }

    fn remove_from(&self, list: &RefCell<Vec<ClientPtr>>, client: &ClientPtr) {
        list.borrow_mut().retain(|c| !Rc::ptr_eq(c, client));
    }

    fn finalize_destroy(&self, client: &ClientPtr) {
        {
            let mut c = client.borrow_mut();
            if c.destroyed {
                return;
            }
            c.destroyed = true;
            if let Some(timer) = c.connect_timer.take() {
                timer.disable();
            }
            if let Some(span) = c.length_span.take() {
                span.complete();
            }
        }

        self.inner.stats.cx_destroy.inc();
        self.inner.stats.cx_active.dec();

        // The client (and its connection) must not unwind while one of its
        // own callbacks may still be on the stack.
        self.inner.dispatcher.deferred_delete(Box::new(client.clone()));
        self.check_for_drained();
    }

    /// Keep the queue from starving: whenever capacity or coverage changes,
    /// ensure an uncovered pending request has a connect in flight.
    fn maybe_create_for_pending(&self) {
        if self.inner.pending_requests.borrow().is_empty() {
            return;
        }
        if self.connecting_count() != 0 {
            return;
        }
        let total =
            self.inner.busy_clients.borrow().len() + self.inner.ready_clients.borrow().len();
        if total < self.inner.config.max_connections {
            self.create_client();
        }
    }

    fn check_for_drained(&self) {
        if self.inner.draining_check.get() {
            return;
        }
        if self.inner.drained_callbacks.borrow().is_empty() {
            return;
        }
        if !self.inner.pending_requests.borrow().is_empty()
            || !self.inner.busy_clients.borrow().is_empty()
        {
            return;
        }

        self.inner.draining_check.set(true);

        // Quiescent: retire idle clients, then notify.
        let ready: Vec<ClientPtr> = self.inner.ready_clients.borrow().clone();
        for client in ready {
            let connection = client.borrow().connection.clone();
            connection.close(CloseType::NoFlush);
        }

        let callbacks: Vec<Rc<dyn Fn()>> = self.inner.drained_callbacks.borrow().clone();
        for cb in callbacks {
            cb();
        }

        self.inner.draining_check.set(false);
    }

    #[cfg(test)]
    pub(crate) fn sizes(&self) -> (usize, usize, usize) {
        (
            self.inner.ready_clients.borrow().len(),
            self.inner.busy_clients.borrow().len(),
            self.inner.pending_requests.borrow().len(),
        )
    }
}

/// Encoder for the request bound to a codec client. Valid for one exchange;
/// calls after the client is gone are no-ops.
#[derive(Clone)]
pub struct StreamEncoder {
    client: Weak<RefCell<ActiveClient>>,
}

impl StreamEncoder {
    pub fn encode_headers(&self, head: &RequestHead, end_stream: bool) {
        let bytes = encode_request_head(head, end_stream);
        self.write(&bytes);
    }

    pub fn encode_data(&self, data: &[u8], _end_stream: bool) {
        self.write(data);
    }

    /// Observe abnormal termination of this stream.
    pub fn add_stream_callbacks(&self, callbacks: Rc<dyn StreamCallbacks>) {
        if let Some(client) = self.client.upgrade() {
            if let Some(bound) = client.borrow_mut().bound.as_mut() {
                bound.stream_callbacks.push(callbacks);
            }
        }
    }

    fn write(&self, data: &[u8]) {
        if let Some(client) = self.client.upgrade() {
            let connection = client.borrow().connection.clone();
            connection.write(data);
        }
    }
}

struct ClientConnectionCallbacks {
    pool: Weak<PoolInner>,
    client: Weak<RefCell<ActiveClient>>,
}

impl ConnectionCallbacks for ClientConnectionCallbacks {
    fn on_event(&self, event: ConnectionEvent) {
        if let (Some(pool), Some(client)) = (self.pool.upgrade(), self.client.upgrade()) {
            ConnPool { inner: pool }.on_connection_event(&client, event);
        }
    }
}

struct ClientReadFilter {
    pool: Weak<PoolInner>,
    client: Weak<RefCell<ActiveClient>>,
}

impl ReadFilter for ClientReadFilter {
    fn on_data(&mut self, data: &mut BytesMut, ops: &mut dyn ConnectionOps) -> FilterStatus {
        let (Some(pool), Some(client)) = (self.pool.upgrade(), self.client.upgrade()) else {
            data.clear();
            return FilterStatus::StopIteration;
        };
        let pool = ConnPool { inner: pool };

        while !data.is_empty() {
            let (mut parser, decoder) = {
                let mut c = client.borrow_mut();
                (
                    std::mem::take(&mut c.parser),
                    c.bound.as_ref().map(|b| b.decoder.clone()),
                )
            };
            let outcome = parser.parse(data, decoder.as_ref());
            client.borrow_mut().parser = parser;

            match outcome {
                Ok(ParseOutcome::NeedMore) => break,
                Ok(ParseOutcome::Complete { connection_close }) => {
                    pool.on_response_complete(&client, connection_close, ops);
                    if client.borrow().state == ClientState::Closed {
                        data.clear();
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "upstream response codec error");
                    data.clear();
                    // The Busy close path resets the bound stream and keeps
                    // the accounting straight.
                    ops.close(CloseType::NoFlush);
                    break;
                }
            }
        }

        FilterStatus::StopIteration
    }
}
