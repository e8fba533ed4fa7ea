//! Worker threads.
//!
//! Each worker is a native OS thread owning its own dispatcher and
//! connection handler; the only shared pieces are the listen sockets (one
//! fd, registered in every worker's loop) and the stats store. Cross-thread
//! control is limited to the loop's post handle and a pair of flags a
//! worker-side timer polls.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use tracing::{debug, error, info};

use relayd_net::event::{PostHandle, RunType};
use relayd_net::tls::ServerTlsContext;
use relayd_net::{ListenerOptions, ListenSocket};
use relayd_stats::Store;

use crate::config::FilterConfig;
use crate::filters::ConfiguredFilterChainFactory;
use crate::server::handler::ConnectionHandlerImpl;

const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Keeps an idle worker loop from ever running dry of timers.
const NO_EXIT_INTERVAL: Duration = Duration::from_secs(3600);

/// Everything a worker needs to stand up one listener. All fields are
/// `Send`; the per-worker filter chain factory is built on the worker's own
/// thread from the filter configs.
#[derive(Clone)]
pub struct ListenerSetup {
    pub socket: Arc<ListenSocket>,
    pub options: ListenerOptions,
    pub tls: Option<ServerTlsContext>,
    pub filters: Vec<FilterConfig>,
}

/// Handle to one spawned worker.
pub struct WorkerHandle {
    id: usize,
    post: PostHandle,
    drain: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Tell the worker to stop accepting; existing connections continue.
    pub fn drain_listeners(&self) {
        self.drain.store(true, Ordering::Release);
    }

    /// Exit the worker's loop and join the thread.
    pub fn shutdown(mut self) {
        self.post.exit();
        if let Some(join) = self.join.take() {
            match join.join() {
                Ok(()) => debug!(worker_id = self.id, "worker thread exited cleanly"),
                Err(e) => error!(worker_id = self.id, error = ?e, "worker thread panicked"),
            }
        }
    }
}

/// Spawn `count` workers, each serving every configured listener.
pub fn spawn_workers(
    count: usize,
    listeners: Vec<ListenerSetup>,
    store: Store,
) -> Result<Vec<WorkerHandle>> {
    info!(workers = count, listeners = listeners.len(), "starting workers");

    let mut handles = Vec::with_capacity(count);
    for worker_id in 0..count {
        let listeners = listeners.clone();
        let store = store.clone();
        let drain = Arc::new(AtomicBool::new(false));
        let drain_flag = Arc::clone(&drain);

        // The dispatcher is built on the worker thread; its post handle
        // comes back over a rendezvous channel.
        let (post_tx, post_rx) = bounded::<PostHandle>(1);

        let join = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker_routine(worker_id, listeners, store, drain_flag, post_tx))
            .with_context(|| format!("failed to spawn worker {worker_id}"))?;

        let post = post_rx
            .recv()
            .with_context(|| format!("worker {worker_id} failed during startup"))?;

        handles.push(WorkerHandle {
            id: worker_id,
            post,
            drain,
            join: Some(join),
        });
    }

    Ok(handles)
}

fn worker_routine(
    worker_id: usize,
    listeners: Vec<ListenerSetup>,
    store: Store,
    drain: Arc<AtomicBool>,
    post_tx: crossbeam_channel::Sender<PostHandle>,
) {
    let dispatcher = match relayd_net::event::Dispatcher::new() {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!(worker_id, error = %e, "failed to create worker event loop");
            return;
        }
    };
    if post_tx.send(dispatcher.post_handle()).is_err() {
        return;
    }

    let handler = ConnectionHandlerImpl::new(Rc::clone(&dispatcher), store);

    for setup in &listeners {
        let factory = match ConfiguredFilterChainFactory::new(setup.filters.clone()) {
            Ok(factory) => factory,
            Err(e) => {
                // Filter names were validated at config load; getting here
                // means the registry and validation disagree.
                error!(worker_id, error = %e, "filter chain construction failed");
                return;
            }
        };
        if let Err(e) = handler.add_listener(
            factory,
            Arc::clone(&setup.socket),
            setup.options,
            setup.tls.clone(),
        ) {
            error!(worker_id, error = %e, "failed to add listener");
            return;
        }
    }

    handler.start_watchdog();

    // Control flags polled on the loop; cheaper than a cross-thread wake
    // protocol and invisible off the hot path.
    let control_handler = Rc::downgrade(&handler);
    let control_drain = Arc::clone(&drain);
    let control_timer: Rc<std::cell::RefCell<Option<relayd_net::event::Timer>>> =
        Rc::new(std::cell::RefCell::new(None));
    let control_timer_clone = Rc::clone(&control_timer);
    let timer = dispatcher.create_timer(move || {
        if control_drain.load(Ordering::Acquire) {
            if let Some(handler) = control_handler.upgrade() {
                handler.close_listeners();
            }
            control_drain.store(false, Ordering::Release);
        }
        if let Some(timer) = control_timer_clone.borrow().as_ref() {
            timer.enable_timer(CONTROL_POLL_INTERVAL);
        }
    });
    timer.enable_timer(CONTROL_POLL_INTERVAL);
    *control_timer.borrow_mut() = Some(timer);

    let no_exit_timer: Rc<std::cell::RefCell<Option<relayd_net::event::Timer>>> =
        Rc::new(std::cell::RefCell::new(None));
    let no_exit_clone = Rc::clone(&no_exit_timer);
    let timer = dispatcher.create_timer(move || {
        if let Some(timer) = no_exit_clone.borrow().as_ref() {
            timer.enable_timer(NO_EXIT_INTERVAL);
        }
    });
    timer.enable_timer(NO_EXIT_INTERVAL);
    *no_exit_timer.borrow_mut() = Some(timer);

    info!(worker_id, "worker entering dispatch loop");
    dispatcher.run(RunType::Block);
    info!(worker_id, "worker exited dispatch loop");

    // Tear down every connection on this thread before it goes away.
    handler.close_connections();
}
