use super::*;

use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;

use relayd_net::event::RunType;
use relayd_net::ListenSocket;
use relayd_stats::Store;

/// Distinct ids per test so parallel tests never share a region or socket
/// namespace slot.
fn unique_base_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    u64::from(std::process::id()) * 1000 + NEXT.fetch_add(1, Ordering::Relaxed)
}

fn options(base_id: u64, restart_epoch: u64) -> Options {
    Options {
        config_path: String::new(),
        base_id,
        restart_epoch,
        concurrency: 1,
        log_level: "info".to_string(),
    }
}

fn inode_of(fd: RawFd) -> (u64, u64) {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    assert_eq!(0, rc);
    (stat.st_dev, stat.st_ino)
}

#[test]
fn test_shared_memory_create_and_attach() {
    let base_id = unique_base_id();
    let parent = HotRestart::new(&options(base_id, 0)).unwrap();
    assert_eq!(
        format!("{}.{}", SHARED_MEMORY_VERSION, mem::size_of::<SharedMemory>()),
        parent.version()
    );

    let child = HotRestart::new(&options(base_id, 1)).unwrap();
    assert_eq!(parent.version(), child.version());
}

#[test]
fn test_shared_memory_version_mismatch_is_fatal() {
    let base_id = unique_base_id();
    let parent = HotRestart::new(&options(base_id, 0)).unwrap();

    unsafe { (*parent.shmem).version = SHARED_MEMORY_VERSION + 1 };

    let err = HotRestart::new(&options(base_id, 1)).unwrap_err();
    assert!(err.to_string().contains("version mismatch"));
}

#[test]
fn test_stat_slots_shared_between_generations() {
    let base_id = unique_base_id();
    let parent = HotRestart::new(&options(base_id, 0)).unwrap();
    let child = HotRestart::new(&options(base_id, 1)).unwrap();

    let parent_store = Store::new(parent.stat_allocator());
    let child_store = Store::new(child.stat_allocator());

    // Both generations resolve the same name to the same slot.
    parent_store.counter("downstream_cx_total").add(3);
    child_store.counter("downstream_cx_total").add(4);
    assert_eq!(7, parent_store.counter("downstream_cx_total").value());
}

#[test]
fn test_stat_slot_alloc_free_and_truncation() {
    let base_id = unique_base_id();
    let parent = HotRestart::new(&options(base_id, 0)).unwrap();
    let allocator = parent.stat_allocator();

    let slot = allocator.alloc("a_counter").unwrap();
    let again = allocator.alloc("a_counter").unwrap();
    assert!(std::ptr::eq(slot.raw(), again.raw()));
    unsafe {
        assert_eq!(2, (*slot.raw()).ref_count.load(Ordering::Relaxed));
    }

    // Truncated names still match on the stored form.
    let long: String = "x".repeat(relayd_stats::MAX_NAME_SIZE + 50);
    let long_slot = allocator.alloc(&long).unwrap();
    let long_again = allocator.alloc(&long).unwrap();
    assert!(std::ptr::eq(long_slot.raw(), long_again.raw()));
    allocator.free(long_slot);
    allocator.free(long_again);
    unsafe {
        assert!(!(*long_slot.raw()).initialized());
    }

    allocator.free(slot);
    allocator.free(again);
    unsafe {
        assert!(!(*slot.raw()).initialized());
    }
}

struct StubServer {
    listen_fd: RawFd,
    address: String,
    drained: Arc<AtomicBool>,
}

impl HotRestartServer for StubServer {
    fn listen_socket_fd(&self, address: &str) -> Option<RawFd> {
        (address == self.address).then_some(self.listen_fd)
    }

    fn shutdown_admin(&self) -> u64 {
        424242
    }

    fn parent_stats(&self) -> (u64, u64) {
        (1234, 7)
    }

    fn drain_listeners(&self) {
        self.drained.store(true, Ordering::Release);
    }
}

/// Full parent/child RPC exchange over the real datagram sockets: socket
/// fd hand-off (same inode), stats query, admin shutdown, listener drain,
/// and the unknown-type reply.
#[test]
fn test_rpc_round_trip_between_generations() {
    let base_id = unique_base_id();
    let drained = Arc::new(AtomicBool::new(false));
    let drained_parent = Arc::clone(&drained);

    let (ready_tx, ready_rx) = mpsc::channel::<((u64, u64), String)>();
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let parent_thread = std::thread::spawn(move || {
        let dispatcher = relayd_net::event::Dispatcher::new().unwrap();
        let parent = HotRestart::new(&options(base_id, 0)).unwrap();

        let socket = ListenSocket::bind_url("tcp://127.0.0.1:0", true).unwrap();
        let address = socket.local_address().to_string();
        let server: Rc<dyn HotRestartServer> = Rc::new(StubServer {
            listen_fd: socket.fd(),
            address: address.clone(),
            drained: drained_parent,
        });
        parent.initialize(&dispatcher, Rc::downgrade(&server)).unwrap();

        ready_tx.send((inode_of(socket.fd()), address)).unwrap();

        // Serve until the child side is done.
        while stop_rx.try_recv().is_err() {
            dispatcher.run(RunType::NonBlock);
            std::thread::sleep(std::time::Duration::from_micros(200));
        }
    });

    let ((parent_dev, parent_ino), address) = ready_rx.recv().unwrap();
    let child = HotRestart::new(&options(base_id, 1)).unwrap();

    // Listen socket hand-off: the received fd refers to the parent's inode.
    let fd = child.duplicate_parent_listen_socket(&address).unwrap();
    assert_eq!((parent_dev, parent_ino), inode_of(fd));
    unsafe { libc::close(fd) };

    // Unknown addresses return no fd (and no ancillary data).
    assert!(child
        .duplicate_parent_listen_socket("tcp://127.0.0.1:1")
        .is_none());

    // Stats and admin shutdown flow back synchronously.
    assert_eq!((1234, 7), child.get_parent_stats());
    assert_eq!(Some(424242), child.shutdown_parent_admin());

    // Drain has no reply; poll for the side effect.
    child.drain_parent_listeners();
    for _ in 0..1000 {
        if drained.load(Ordering::Acquire) {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert!(drained.load(Ordering::Acquire));

    // A message type from the future gets UnknownRequestReply, not silence.
    let future = RpcBase {
        type_: 999,
        length_: mem::size_of::<RpcBase>() as u64,
    };
    child.send_message(&child.parent_address, rpc_bytes(&future));
    let (reply_type, _, reply_fd) = child.receive_rpc(true).unwrap();
    assert_eq!(RpcMessageType::UnknownRequestReply as u64, reply_type);
    assert!(reply_fd.is_none());

    stop_tx.send(()).unwrap();
    parent_thread.join().unwrap();
}

#[test]
fn test_epoch_zero_has_no_parent() {
    let base_id = unique_base_id();
    let first = HotRestart::new(&options(base_id, 0)).unwrap();
    assert!(first.duplicate_parent_listen_socket("tcp://127.0.0.1:1").is_none());
    assert_eq!((0, 0), first.get_parent_stats());
    assert!(first.shutdown_parent_admin().is_none());
    // No-ops rather than errors.
    first.drain_parent_listeners();
    first.terminate_parent();
}

#[test]
fn test_domain_socket_slots_wrap_at_three() {
    // Epoch 3 reuses epoch 0's slot; the names must collide by design.
    let a = domain_socket_address(100, 0);
    let b = domain_socket_address(100, 3);
    let a_path: Vec<libc::c_char> = a.sun_path.to_vec();
    assert_eq!(a_path, b.sun_path.to_vec());

    let c = domain_socket_address(100, 1);
    assert_ne!(a_path, c.sun_path.to_vec());
}
