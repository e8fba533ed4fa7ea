//! Server instance: startup sequence, hot-restart integration, workers,
//! signals, and the periodic stats flush.
//!
//! Startup order matters: the shared-memory region and RPC socket come up
//! first (stats need the allocator), then configuration, then listen
//! sockets — asking the previous generation for each address before binding
//! fresh — then the workers, and only then is the parent told to drain.

pub mod handler;
pub mod hot_restart;
pub mod worker;


use std::cell::{Cell, RefCell};
use std::io::Read;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tracing::{info, warn};

use relayd_net::event::{Dispatcher, FileEvent, Ready, RunType, Timer, Trigger};
use relayd_net::tls::ServerTlsContext;
use relayd_net::{ListenerOptions, ListenSocket};
use relayd_stats::{Gauge, Store};

use crate::config::load_config;
use crate::options::Options;
use hot_restart::{HotRestart, HotRestartServer};
use worker::{ListenerSetup, WorkerHandle};

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Instance {
    dispatcher: Rc<Dispatcher>,
    store: Store,
    hot_restart: Rc<HotRestart>,
    listen_sockets: Vec<(SocketAddr, Arc<ListenSocket>)>,
    workers: RefCell<Vec<WorkerHandle>>,
    total_connections: Gauge,
    /// Start time of the first epoch, carried across hot restarts for
    /// continuous uptime reporting.
    original_start_time: u64,
    flush_timer: RefCell<Option<Timer>>,
    parent_shutdown_timer: RefCell<Option<Timer>>,
    signal_event: RefCell<Option<FileEvent>>,
    shutting_down: Cell<bool>,
}

impl HotRestartServer for Instance {
    fn listen_socket_fd(&self, address: &str) -> Option<std::os::fd::RawFd> {
        self.listen_sockets
            .iter()
            .find(|(addr, _)| addr.to_string() == address)
            .map(|(_, socket)| socket.fd())
    }

    fn shutdown_admin(&self) -> u64 {
        info!("shutting down admin due to child startup");
        self.original_start_time
    }

    fn parent_stats(&self) -> (u64, u64) {
        (self.store.memory_used(), self.total_connections.value())
    }

    fn drain_listeners(&self) {
        info!("draining listeners due to child startup");
        for worker in self.workers.borrow().iter() {
            worker.drain_listeners();
        }
    }
}

impl Instance {
    fn flush_stats(&self, interval: Duration) {
        let (parent_memory, parent_connections) = self.hot_restart.get_parent_stats();
        info!(
            connections = self.total_connections.value() + parent_connections,
            stat_memory = self.store.memory_used() + parent_memory,
            "stats flush"
        );
        for (name, value) in self.store.snapshot() {
            if value != 0 {
                tracing::debug!(stat = %name, value, "flushed");
            }
        }
        if let Some(timer) = self.flush_timer.borrow().as_ref() {
            timer.enable_timer(interval);
        }
    }

    fn shutdown(&self) {
        if self.shutting_down.replace(true) {
            return;
        }
        info!("shutting down server");
        for worker in self.workers.borrow_mut().drain(..) {
            worker.shutdown();
        }
        self.dispatcher.exit();
    }
}

/// Bring the server up and run the main thread's loop until a termination
/// signal arrives.
pub fn run(options: Options) -> Result<()> {
    let hot_restart = HotRestart::new(&options)?;
    info!(
        version = %hot_restart.version(),
        epoch = options.restart_epoch,
        "hot restart initialized"
    );

    let store = Store::new(hot_restart.stat_allocator());
    let config = load_config(Path::new(&options.config_path))?;

    // Uptime is reported from the first generation's start.
    let original_start_time = hot_restart
        .shutdown_parent_admin()
        .unwrap_or_else(now_epoch_seconds);

    let mut listen_sockets = Vec::new();
    let mut setups = Vec::new();
    for listener_cfg in &config.listeners {
        let address = listener_cfg.resolved_address()?;

        // Prefer the parent's live socket so no connection is dropped over
        // the restart.
        let inherited = if listener_cfg.bind_to_port {
            hot_restart.duplicate_parent_listen_socket(&address.to_string())
        } else {
            None
        };
        let socket = match inherited {
            Some(fd) => {
                info!(%address, fd, "inherited listen socket from parent");
                ListenSocket::from_inherited_fd(fd)?
            }
            None => ListenSocket::bind(address, listener_cfg.bind_to_port)?,
        };
        let socket = Arc::new(socket);
        listen_sockets.push((socket.local_address(), Arc::clone(&socket)));

        let tls = match &listener_cfg.ssl_context {
            Some(ssl) => Some(
                ServerTlsContext::new(&ssl.to_tls_config())
                    .with_context(|| format!("listener {address}"))?,
            ),
            None => None,
        };

        setups.push(ListenerSetup {
            socket,
            options: ListenerOptions {
                bind_to_port: listener_cfg.bind_to_port,
                use_proxy_proto: listener_cfg.use_proxy_proto,
                use_original_dst: listener_cfg.use_original_dst,
                per_connection_buffer_limit_bytes: listener_cfg.per_connection_buffer_limit_bytes,
            },
            tls,
            filters: listener_cfg.filters.clone(),
        });
    }

    let workers = worker::spawn_workers(options.worker_count(), setups, store.clone())?;

    let dispatcher = Dispatcher::new()?;
    let instance = Rc::new(Instance {
        dispatcher: Rc::clone(&dispatcher),
        store: store.clone(),
        hot_restart: Rc::clone(&hot_restart),
        listen_sockets,
        workers: RefCell::new(workers),
        total_connections: store.gauge("server.total_connections"),
        original_start_time,
        flush_timer: RefCell::new(None),
        parent_shutdown_timer: RefCell::new(None),
        signal_event: RefCell::new(None),
        shutting_down: Cell::new(false),
    });

    // Serve hot-restart RPCs from the next generation.
    let server_dyn: Rc<dyn HotRestartServer> = instance.clone();
    hot_restart.initialize(&dispatcher, Rc::downgrade(&server_dyn))?;

    // Everything is up; the previous generation can stop accepting now, and
    // after the grace period it is told to exit entirely.
    hot_restart.drain_parent_listeners();
    if options.restart_epoch != 0 {
        let hot_restart_for_timer = Rc::clone(&hot_restart);
        let timer = dispatcher.create_timer(move || {
            hot_restart_for_timer.terminate_parent();
        });
        timer.enable_timer(Duration::from_millis(config.parent_shutdown_time_ms));
        *instance.parent_shutdown_timer.borrow_mut() = Some(timer);
    }

    install_signal_handlers(&dispatcher, &instance)?;

    let flush_interval = Duration::from_millis(config.stats_flush_interval_ms);
    let instance_for_flush = Rc::downgrade(&instance);
    let timer = dispatcher.create_timer(move || {
        if let Some(instance) = instance_for_flush.upgrade() {
            instance.flush_stats(flush_interval);
        }
    });
    timer.enable_timer(flush_interval);
    *instance.flush_timer.borrow_mut() = Some(timer);

    info!(
        listeners = instance.listen_sockets.len(),
        workers = options.worker_count(),
        "server started"
    );

    dispatcher.run(RunType::Block);

    info!("exiting");
    Ok(())
}

/// SIGTERM/SIGINT request orderly shutdown. Delivery rides a self-pipe into
/// the main loop so the handler itself does nothing async-unsafe.
fn install_signal_handlers(dispatcher: &Rc<Dispatcher>, instance: &Rc<Instance>) -> Result<()> {
    let (read_end, write_end) =
        std::os::unix::net::UnixStream::pair().context("signal pipe creation failed")?;
    read_end.set_nonblocking(true)?;
    write_end.set_nonblocking(true)?;

    signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGTERM, write_end.as_raw_fd())
        .context("failed to install SIGTERM handler")?;
    signal_hook::low_level::pipe::register_raw(signal_hook::consts::SIGINT, write_end.as_raw_fd())
        .context("failed to install SIGINT handler")?;
    // The write end must outlive the process's signal handling.
    std::mem::forget(write_end);

    let instance_weak = Rc::downgrade(instance);
    let read_end_for_event = read_end;
    let event = dispatcher.create_file_event(
        read_end_for_event.as_raw_fd(),
        Trigger::Edge,
        Ready::READ,
        move |_ready| {
            let mut buf = [0u8; 16];
            while let Ok(n) = (&read_end_for_event).read(&mut buf) {
                if n == 0 {
                    break;
                }
            }
            if let Some(instance) = instance_weak.upgrade() {
                warn!("caught shutdown signal");
                instance.shutdown();
            }
        },
    )?;
    *instance.signal_event.borrow_mut() = Some(event);
    Ok(())
}
