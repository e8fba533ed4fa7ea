use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use tracing::trace;

use super::{Ready, RunType, Trigger};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

type FileEventCb = Rc<RefCell<dyn FnMut(Ready)>>;
type TimerCb = Rc<RefCell<dyn FnMut()>>;
type PostCb = Box<dyn FnOnce() + Send>;

struct FdEntry {
    fd: RawFd,
    cb: FileEventCb,
    interest: Ready,
    trigger: Trigger,
    registered: bool,
}

struct TimerEntry {
    cb: TimerCb,
    /// Bumped on every enable/disable so stale heap entries are ignored.
    generation: u64,
    armed: bool,
}

/// Single-threaded readiness dispatcher.
///
/// Owns the poll instance, the fd callback table, the timer wheel, the
/// cross-thread post queue, and the two deferred-deletion lists. Not `Send`;
/// construct one per worker thread.
pub struct Dispatcher {
    registry: Registry,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    waker: Arc<Waker>,
    fd_entries: RefCell<Slab<FdEntry>>,
    /// Manually scheduled (token, readiness) dispatches, drained before the
    /// loop blocks again.
    activations: RefCell<VecDeque<(usize, Ready)>>,
    timers: RefCell<Slab<TimerEntry>>,
    timer_heap: RefCell<BinaryHeap<Reverse<(Instant, usize, u64)>>>,
    post_callbacks: Arc<Mutex<VecDeque<PostCb>>>,
    to_delete: [RefCell<Vec<Box<dyn Any>>>; 2],
    current_to_delete: Cell<usize>,
    deferred_deleting: Cell<bool>,
    deferred_delete_timer: RefCell<Option<Timer>>,
    exit_requested: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new() -> io::Result<Rc<Dispatcher>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let dispatcher = Rc::new(Dispatcher {
            registry,
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
            waker,
            fd_entries: RefCell::new(Slab::new()),
            activations: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Slab::new()),
            timer_heap: RefCell::new(BinaryHeap::new()),
            post_callbacks: Arc::new(Mutex::new(VecDeque::new())),
            to_delete: [RefCell::new(Vec::new()), RefCell::new(Vec::new())],
            current_to_delete: Cell::new(0),
            deferred_deleting: Cell::new(false),
            deferred_delete_timer: RefCell::new(None),
            exit_requested: Arc::new(AtomicBool::new(false)),
        });

        let weak = Rc::downgrade(&dispatcher);
        let timer = dispatcher.create_timer(move || {
            if let Some(d) = weak.upgrade() {
                d.clear_current_delete_list();
            }
        });
        *dispatcher.deferred_delete_timer.borrow_mut() = Some(timer);

        Ok(dispatcher)
    }

    /// Register `fd` for readiness callbacks. The returned handle owns the
    /// registration; dropping it deregisters the fd.
    pub fn create_file_event(
        self: &Rc<Self>,
        fd: RawFd,
        trigger: Trigger,
        interest: Ready,
        cb: impl FnMut(Ready) + 'static,
    ) -> io::Result<FileEvent> {
        let key = {
            let mut entries = self.fd_entries.borrow_mut();
            entries.insert(FdEntry {
                fd,
                cb: Rc::new(RefCell::new(cb)),
                interest,
                trigger,
                registered: false,
            })
        };

        if let Err(e) = self.register_fd(key, fd, interest) {
            self.fd_entries.borrow_mut().remove(key);
            return Err(e);
        }

        Ok(FileEvent {
            key,
            fd,
            dispatcher: Rc::downgrade(self),
        })
    }

    /// Create a disarmed timer. Millisecond resolution; one-shot, re-arm from
    /// the callback for periodic behaviour.
    pub fn create_timer(self: &Rc<Self>, cb: impl FnMut() + 'static) -> Timer {
        let key = self.timers.borrow_mut().insert(TimerEntry {
            cb: Rc::new(RefCell::new(cb)),
            generation: 0,
            armed: false,
        });

        Timer {
            key,
            dispatcher: Rc::downgrade(self),
        }
    }

    /// Queue a closure from this thread. It runs on the loop's next
    /// iteration. For other threads, see [`Dispatcher::post_handle`].
    pub fn post(&self, cb: impl FnOnce() + Send + 'static) {
        self.post_callbacks.lock().unwrap().push_back(Box::new(cb));
        // Waking an already-awake loop is harmless.
        let _ = self.waker.wake();
    }

    /// A `Send` handle other threads use to post closures onto this loop or
    /// request its exit.
    pub fn post_handle(&self) -> PostHandle {
        PostHandle {
            queue: Arc::clone(&self.post_callbacks),
            waker: Arc::clone(&self.waker),
            exit: Arc::clone(&self.exit_requested),
        }
    }

    /// Park an object for destruction after the current loop iteration.
    ///
    /// The object is dropped by a zero-delay timer, so its destructor never
    /// runs while one of its own callbacks is still on the stack.
    pub fn deferred_delete(&self, item: Box<dyn Any>) {
        let idx = self.current_to_delete.get();
        let mut list = self.to_delete[idx].borrow_mut();
        list.push(item);
        trace!(size = list.len(), "item added to deferred deletion list");
        if list.len() == 1 {
            drop(list);
            if let Some(timer) = self.deferred_delete_timer.borrow().as_ref() {
                timer.enable_timer(Duration::from_millis(0));
            }
        }
    }

    /// Synchronously flush both deferred-deletion lists. Shutdown and test
    /// path; during normal operation the zero-delay timer does this.
    pub fn clear_deferred_delete_list(&self) {
        // One pass per list: the swap performed by each pass makes the other
        // list current.
        self.clear_current_delete_list();
        self.clear_current_delete_list();
    }

    /// Request loop exit. Safe to call from callbacks.
    pub fn exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    pub fn run(&self, run_type: RunType) {
        match run_type {
            RunType::NonBlock => {
                self.poll_once(false);
            }
            RunType::Block => {
                self.exit_requested.store(false, Ordering::Release);
                while !self.exit_requested.load(Ordering::Acquire) {
                    self.poll_once(true);
                }
            }
        }
    }

    fn clear_current_delete_list(&self) {
        if self.deferred_deleting.get() {
            return;
        }

        let idx = self.current_to_delete.get();
        let items = {
            let mut list = self.to_delete[idx].borrow_mut();
            if list.is_empty() {
                return;
            }
            std::mem::take(&mut *list)
        };

        trace!(size = items.len(), "clearing deferred deletion list");

        // Swap lists before dropping: deletions scheduled by these
        // destructors land on the other list and get their own tick.
        self.current_to_delete.set(1 - idx);
        self.deferred_deleting.set(true);
        drop(items);
        self.deferred_deleting.set(false);
    }

    fn poll_once(&self, block: bool) {
        // Timers armed anywhere in this iteration (deferred deletes included)
        // get deadlines after this capture and wait for the next iteration.
        let iteration_start = Instant::now();

        self.run_post_callbacks();
        self.run_activations();

        let timeout = if !block
            || self.exit_requested.load(Ordering::Acquire)
            || !self.activations.borrow().is_empty()
        {
            Some(Duration::ZERO)
        } else {
            self.next_timer_delay()
        };

        let fired: Vec<(Token, Ready)> = {
            let mut events = self.events.borrow_mut();
            match self.poll.borrow_mut().poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => panic!("event loop poll failure: {e}"),
            }

            events
                .iter()
                .map(|event| {
                    let mut ready = Ready::EMPTY;
                    if event.is_readable() {
                        ready |= Ready::READ;
                    }
                    if event.is_writable() {
                        ready |= Ready::WRITE;
                    }
                    if event.is_read_closed() || event.is_write_closed() || event.is_error() {
                        ready |= Ready::CLOSED;
                    }
                    (event.token(), ready)
                })
                .collect()
        };

        for (token, ready) in fired {
            if token == WAKER_TOKEN {
                self.run_post_callbacks();
                continue;
            }
            self.dispatch_fd(token.0, ready);
        }

        self.run_due_timers(iteration_start);
    }

    fn run_activations(&self) {
        loop {
            let next = self.activations.borrow_mut().pop_front();
            match next {
                Some((key, ready)) => self.dispatch_fd(key, ready),
                None => break,
            }
        }
    }

    fn dispatch_fd(&self, key: usize, ready: Ready) {
        let (cb, trigger) = {
            let entries = self.fd_entries.borrow();
            match entries.get(key) {
                Some(entry) => (entry.cb.clone(), entry.trigger),
                None => return,
            }
        };

        (cb.borrow_mut())(ready);

        if trigger == Trigger::Level {
            self.recheck_level(key);
        }
    }

    /// Level-triggered emulation on top of an edge-triggered poller: after a
    /// dispatch, probe the fd and reschedule while the condition holds.
    fn recheck_level(&self, key: usize) {
        let (fd, interest) = {
            let entries = self.fd_entries.borrow();
            match entries.get(key) {
                Some(entry) if entry.registered => (entry.fd, entry.interest),
                _ => return,
            }
        };

        let mut events: libc::c_short = 0;
        if interest.is_readable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        if events == 0 {
            return;
        }

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc <= 0 {
            return;
        }

        let mut ready = Ready::EMPTY;
        if pfd.revents & libc::POLLIN != 0 {
            ready |= Ready::READ;
        }
        if pfd.revents & libc::POLLOUT != 0 {
            ready |= Ready::WRITE;
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            ready |= Ready::CLOSED;
        }
        if !ready.is_empty() {
            self.activations.borrow_mut().push_back((key, ready));
        }
    }

    fn run_post_callbacks(&self) {
        loop {
            let cb = self.post_callbacks.lock().unwrap().pop_front();
            match cb {
                Some(cb) => cb(),
                None => break,
            }
        }
    }

    fn next_timer_delay(&self) -> Option<Duration> {
        // Stale heap entries (disabled or re-armed timers) only make the
        // wakeup earlier than needed, which is harmless.
        self.timer_heap
            .borrow()
            .peek()
            .map(|Reverse((deadline, _, _))| deadline.saturating_duration_since(Instant::now()))
    }

    fn run_due_timers(&self, now: Instant) {
        loop {
            let due = {
                let heap = self.timer_heap.borrow();
                match heap.peek() {
                    Some(Reverse((deadline, key, generation))) if *deadline <= now => {
                        Some((*key, *generation))
                    }
                    _ => None,
                }
            };

            let Some((key, generation)) = due else {
                break;
            };
            self.timer_heap.borrow_mut().pop();

            let cb = {
                let mut timers = self.timers.borrow_mut();
                match timers.get_mut(key) {
                    Some(entry) if entry.generation == generation && entry.armed => {
                        entry.armed = false;
                        Some(entry.cb.clone())
                    }
                    _ => None,
                }
            };

            if let Some(cb) = cb {
                (cb.borrow_mut())();
            }
        }
    }

    fn register_fd(&self, key: usize, fd: RawFd, interest: Ready) -> io::Result<()> {
        let Some(mio_interest) = mio_interest(interest) else {
            return Ok(());
        };
        self.registry
            .register(&mut SourceFd(&fd), Token(key), mio_interest)?;
        if let Some(entry) = self.fd_entries.borrow_mut().get_mut(key) {
            entry.registered = true;
        }
        Ok(())
    }

    fn update_interest(&self, key: usize, interest: Ready) -> io::Result<()> {
        let (fd, registered) = {
            let mut entries = self.fd_entries.borrow_mut();
            let Some(entry) = entries.get_mut(key) else {
                return Ok(());
            };
            entry.interest = interest;
            (entry.fd, entry.registered)
        };

        match (mio_interest(interest), registered) {
            (Some(mio_interest), true) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(key), mio_interest)
            }
            (Some(_), false) => self.register_fd(key, fd, interest),
            (None, true) => {
                if let Some(entry) = self.fd_entries.borrow_mut().get_mut(key) {
                    entry.registered = false;
                }
                self.registry.deregister(&mut SourceFd(&fd))
            }
            (None, false) => Ok(()),
        }
    }

    fn remove_file_event(&self, key: usize, fd: RawFd) {
        let removed = {
            let mut entries = self.fd_entries.borrow_mut();
            if entries.contains(key) {
                Some(entries.remove(key))
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            if entry.registered {
                let _ = self.registry.deregister(&mut SourceFd(&fd));
            }
        }
        self.activations.borrow_mut().retain(|(k, _)| *k != key);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.clear_deferred_delete_list();
    }
}

/// Cross-thread handle onto a worker's loop.
///
/// Closures posted through this handle run serially on the owning worker's
/// next loop iteration.
#[derive(Clone)]
pub struct PostHandle {
    queue: Arc<Mutex<VecDeque<PostCb>>>,
    waker: Arc<Waker>,
    exit: Arc<AtomicBool>,
}

impl PostHandle {
    pub fn post(&self, cb: impl FnOnce() + Send + 'static) {
        self.queue.lock().unwrap().push_back(Box::new(cb));
        let _ = self.waker.wake();
    }

    pub fn exit(&self) {
        self.exit.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

fn mio_interest(ready: Ready) -> Option<Interest> {
    // There is no standalone "closed" interest; hangup is reported on any
    // registration, so a CLOSED-only subscription reads.
    let mut interest = if ready.is_readable() || ready.is_closed() {
        Some(Interest::READABLE)
    } else {
        None
    };
    if ready.is_writable() {
        interest = Some(match interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }
    interest
}

/// Owned fd registration. Dropping deregisters the fd from the loop.
pub struct FileEvent {
    key: usize,
    fd: RawFd,
    dispatcher: Weak<Dispatcher>,
}

impl FileEvent {
    /// Replace the readiness interest. An empty interest parks the fd
    /// without releasing the slot.
    pub fn set_interest(&self, interest: Ready) -> io::Result<()> {
        match self.dispatcher.upgrade() {
            Some(d) => d.update_interest(self.key, interest),
            None => Ok(()),
        }
    }

    /// Schedule a synthetic dispatch with the given readiness on the next
    /// loop iteration, without waiting for the kernel.
    pub fn activate(&self, ready: Ready) {
        if let Some(d) = self.dispatcher.upgrade() {
            d.activations.borrow_mut().push_back((self.key, ready));
        }
    }
}

impl Drop for FileEvent {
    fn drop(&mut self) {
        if let Some(d) = self.dispatcher.upgrade() {
            d.remove_file_event(self.key, self.fd);
        }
    }
}

/// One-shot millisecond timer handle.
pub struct Timer {
    key: usize,
    dispatcher: Weak<Dispatcher>,
}

impl Timer {
    pub fn enable_timer(&self, delay: Duration) {
        let Some(d) = self.dispatcher.upgrade() else {
            return;
        };
        let mut timers = d.timers.borrow_mut();
        let Some(entry) = timers.get_mut(self.key) else {
            return;
        };
        entry.generation += 1;
        entry.armed = true;
        d.timer_heap
            .borrow_mut()
            .push(Reverse((Instant::now() + delay, self.key, entry.generation)));
    }

    pub fn disable(&self) {
        let Some(d) = self.dispatcher.upgrade() else {
            return;
        };
        let mut timers = d.timers.borrow_mut();
        if let Some(entry) = timers.get_mut(self.key) {
            entry.generation += 1;
            entry.armed = false;
        }
    }

    pub fn enabled(&self) -> bool {
        self.dispatcher
            .upgrade()
            .and_then(|d| d.timers.borrow().get(self.key).map(|e| e.armed))
            .unwrap_or(false)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(d) = self.dispatcher.upgrade() {
            let mut timers = d.timers.borrow_mut();
            if timers.contains(self.key) {
                timers.remove(self.key);
            }
        }
    }
}
