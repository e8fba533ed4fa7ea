use super::*;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[test]
fn test_timer_fires_once() {
    let dispatcher = Dispatcher::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let fired_clone = fired.clone();
    let timer = dispatcher.create_timer(move || {
        fired_clone.set(fired_clone.get() + 1);
    });

    timer.enable_timer(Duration::from_millis(0));
    assert!(timer.enabled());

    dispatcher.run(RunType::NonBlock);
    dispatcher.run(RunType::NonBlock);

    assert_eq!(1, fired.get());
    assert!(!timer.enabled());

    // One-shot: nothing further without re-arming.
    dispatcher.run(RunType::NonBlock);
    assert_eq!(1, fired.get());
}

#[test]
fn test_timer_disable_before_fire() {
    let dispatcher = Dispatcher::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let fired_clone = fired.clone();
    let timer = dispatcher.create_timer(move || {
        fired_clone.set(fired_clone.get() + 1);
    });

    timer.enable_timer(Duration::from_millis(0));
    timer.disable();

    dispatcher.run(RunType::NonBlock);
    dispatcher.run(RunType::NonBlock);
    assert_eq!(0, fired.get());
}

#[test]
fn test_timer_rearm_from_callback() {
    let dispatcher = Dispatcher::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
    let fired_clone = fired.clone();
    let timer_clone = timer.clone();
    let dispatcher_clone = Rc::downgrade(&dispatcher);
    *timer.borrow_mut() = Some(dispatcher.create_timer(move || {
        fired_clone.set(fired_clone.get() + 1);
        if fired_clone.get() < 3 {
            if let Some(t) = timer_clone.borrow().as_ref() {
                t.enable_timer(Duration::from_millis(0));
            }
        } else if let Some(d) = dispatcher_clone.upgrade() {
            d.exit();
        }
    }));

    timer.borrow().as_ref().unwrap().enable_timer(Duration::from_millis(0));
    dispatcher.run(RunType::Block);
    assert_eq!(3, fired.get());
}

#[test]
fn test_post_from_other_thread() {
    let dispatcher = Dispatcher::new().unwrap();
    let handle = dispatcher.post_handle();

    let (tx, rx) = std::sync::mpsc::channel::<u32>();
    let join = std::thread::spawn(move || {
        handle.post(move || {
            tx.send(42).unwrap();
        });
    });
    join.join().unwrap();

    dispatcher.run(RunType::NonBlock);
    assert_eq!(42, rx.try_recv().unwrap());
}

#[test]
fn test_exit_from_other_thread() {
    let dispatcher = Dispatcher::new().unwrap();
    let handle = dispatcher.post_handle();

    let join = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        handle.exit();
    });

    dispatcher.run(RunType::Block);
    join.join().unwrap();
}

#[test]
fn test_deferred_delete_outside_callback() {
    struct DropFlag(Rc<Cell<bool>>);
    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    let dispatcher = Dispatcher::new().unwrap();
    let dropped = Rc::new(Cell::new(false));

    let dispatcher_weak = Rc::downgrade(&dispatcher);
    let dropped_clone = dropped.clone();
    let observed_in_callback = Rc::new(Cell::new(false));
    let observed_clone = observed_in_callback.clone();

    let timer = dispatcher.create_timer(move || {
        let d = dispatcher_weak.upgrade().unwrap();
        d.deferred_delete(Box::new(DropFlag(dropped_clone.clone())));
        // Still alive while this callback is on the stack.
        observed_clone.set(!dropped_clone.get());
    });
    timer.enable_timer(Duration::from_millis(0));

    dispatcher.run(RunType::NonBlock); // timer fires, delete scheduled
    assert!(observed_in_callback.get());
    assert!(!dropped.get());

    dispatcher.run(RunType::NonBlock); // zero-delay delete tick
    assert!(dropped.get());
}

#[test]
fn test_clear_deferred_delete_flushes_both_lists() {
    struct Counter(Rc<Cell<u32>>);
    impl Drop for Counter {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let dispatcher = Dispatcher::new().unwrap();
    let drops = Rc::new(Cell::new(0u32));

    dispatcher.deferred_delete(Box::new(Counter(drops.clone())));
    dispatcher.deferred_delete(Box::new(Counter(drops.clone())));
    dispatcher.clear_deferred_delete_list();
    assert_eq!(2, drops.get());
}

#[test]
fn test_deferred_delete_during_drop_gets_own_tick() {
    struct Outer {
        dispatcher: std::rc::Weak<Dispatcher>,
        drops: Rc<Cell<u32>>,
    }
    struct Inner(Rc<Cell<u32>>);
    impl Drop for Inner {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }
    impl Drop for Outer {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
            if let Some(d) = self.dispatcher.upgrade() {
                d.deferred_delete(Box::new(Inner(self.drops.clone())));
            }
        }
    }

    let dispatcher = Dispatcher::new().unwrap();
    let drops = Rc::new(Cell::new(0u32));

    dispatcher.deferred_delete(Box::new(Outer {
        dispatcher: Rc::downgrade(&dispatcher),
        drops: drops.clone(),
    }));
    dispatcher.clear_deferred_delete_list();
    assert_eq!(2, drops.get());
}

#[test]
fn test_file_event_read_write() {
    use std::io::Write;
    use std::os::fd::AsRawFd;

    let dispatcher = Dispatcher::new().unwrap();

    let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();

    let readable = Rc::new(Cell::new(false));
    let readable_clone = readable.clone();
    let _event = dispatcher
        .create_file_event(
            b.as_raw_fd(),
            Trigger::Edge,
            Ready::READ | Ready::WRITE,
            move |ready| {
                if ready.is_readable() {
                    readable_clone.set(true);
                }
            },
        )
        .unwrap();

    a.write_all(b"x").unwrap();
    for _ in 0..10 {
        if readable.get() {
            break;
        }
        dispatcher.run(RunType::NonBlock);
    }
    assert!(readable.get());
}

#[test]
fn test_file_event_level_trigger_redelivers() {
    use std::io::Write;
    use std::os::fd::AsRawFd;

    let dispatcher = Dispatcher::new().unwrap();

    let (mut a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();

    let deliveries = Rc::new(Cell::new(0u32));
    let deliveries_clone = deliveries.clone();
    // Deliberately never reads: a level-triggered event must keep firing.
    let _event = dispatcher
        .create_file_event(b.as_raw_fd(), Trigger::Level, Ready::READ, move |_| {
            deliveries_clone.set(deliveries_clone.get() + 1);
        })
        .unwrap();

    a.write_all(b"x").unwrap();
    for _ in 0..5 {
        dispatcher.run(RunType::NonBlock);
    }
    assert!(
        deliveries.get() >= 2,
        "level-triggered event fired {} times",
        deliveries.get()
    );
}

#[test]
fn test_file_event_activate() {
    let dispatcher = Dispatcher::new().unwrap();

    let (_a, b) = std::os::unix::net::UnixStream::pair().unwrap();
    b.set_nonblocking(true).unwrap();

    use std::os::fd::AsRawFd;
    let writes = Rc::new(Cell::new(0u32));
    let writes_clone = writes.clone();
    let event = dispatcher
        .create_file_event(b.as_raw_fd(), Trigger::Edge, Ready::READ, move |ready| {
            if ready.is_writable() {
                writes_clone.set(writes_clone.get() + 1);
            }
        })
        .unwrap();

    // No kernel event involved: synthetic readiness only.
    event.activate(Ready::WRITE);
    dispatcher.run(RunType::NonBlock);
    assert_eq!(1, writes.get());
}

#[test]
fn test_exit_from_timer() {
    let dispatcher = Dispatcher::new().unwrap();
    let weak = Rc::downgrade(&dispatcher);
    let timer = dispatcher.create_timer(move || {
        if let Some(d) = weak.upgrade() {
            d.exit();
        }
    });
    timer.enable_timer(Duration::from_millis(10));
    // Returns because the timer exits the loop.
    dispatcher.run(RunType::Block);
}
