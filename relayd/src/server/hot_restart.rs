//! Hot restart: shared-memory stats plus the cross-generation RPC.
//!
//! Each process generation maps the same shared-memory region (stat slots
//! behind process-shared robust mutexes) and binds an abstract-namespace
//! datagram socket derived from `base_id` and `restart_epoch mod 3` — at
//! most three generations coexist, and a fourth reclaims the oldest slot.
//! All coordination between generations flows through fixed-size RPC
//! records on those sockets; the listen-socket reply is the one message
//! that carries a file descriptor, via `SCM_RIGHTS`.
//!
//! The receive path switches the socket to blocking for synchronous
//! request/reply exchanges and back to non-blocking for the event-driven
//! server side.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::mem;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use relayd_net::event::{Dispatcher, FileEvent, Ready, Trigger};
use relayd_stats::{RawStatAllocator, RawStatData, StatDataRef};

use crate::options::Options;

/// Bump on any layout or protocol change that breaks cross-generation
/// compatibility; a mismatch forces a full restart.
pub const SHARED_MEMORY_VERSION: u64 = 5;

const NUM_STAT_SLOTS: usize = 16384;
const MAX_CONCURRENT_PROCESSES: u64 = 3;
const RPC_BUFFER_WORDS: usize = 512;

/// The region laid directly into shared memory and mapped by every running
/// generation.
#[repr(C)]
pub struct SharedMemory {
    size: u64,
    version: u64,
    flags: AtomicU64,
    log_lock: libc::pthread_mutex_t,
    access_log_lock: libc::pthread_mutex_t,
    stat_lock: libc::pthread_mutex_t,
    init_lock: libc::pthread_mutex_t,
    stats_slots: [RawStatData; NUM_STAT_SLOTS],
}

/// Process-shared robust pthread mutex living inside the region.
///
/// If another generation dies while holding the lock we take over the
/// inconsistent state and mark it recovered rather than deadlocking.
pub struct ProcessSharedMutex {
    mutex: *mut libc::pthread_mutex_t,
}

// The pointee lives in the shared mapping for the life of the process.
unsafe impl Send for ProcessSharedMutex {}
unsafe impl Sync for ProcessSharedMutex {}

impl ProcessSharedMutex {
    fn new(mutex: *mut libc::pthread_mutex_t) -> ProcessSharedMutex {
        ProcessSharedMutex { mutex }
    }

    pub fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex) };
        if rc == libc::EOWNERDEAD {
            unsafe { libc::pthread_mutex_consistent(self.mutex) };
        } else {
            assert_eq!(0, rc, "process shared mutex lock failed");
        }
    }

    pub fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        assert_eq!(0, rc, "process shared mutex unlock failed");
    }
}

fn initialize_mutex(mutex: *mut libc::pthread_mutex_t) {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        libc::pthread_mutexattr_init(&mut attr);
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
        libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
    }
}

fn shared_memory_name(base_id: u64) -> String {
    format!("/relayd_shared_memory_{base_id}")
}

/// Create (epoch zero) or attach (later epochs) the shared-memory region.
fn initialize_shared_memory(options: &Options) -> Result<*mut SharedMemory> {
    let name = shared_memory_name(options.base_id);
    let c_name = CString::new(name.clone()).unwrap();

    let mut oflags = libc::O_RDWR;
    if options.restart_epoch == 0 {
        oflags |= libc::O_CREAT | libc::O_EXCL;
        // A stale region from an unclean shutdown would fail the exclusive
        // create; clear it first.
        unsafe { libc::shm_unlink(c_name.as_ptr()) };
    }

    let fd = unsafe { libc::shm_open(c_name.as_ptr(), oflags, 0o600) };
    if fd == -1 {
        bail!(
            "cannot open shared memory region {name}, check user permissions: {}",
            std::io::Error::last_os_error()
        );
    }

    let size = mem::size_of::<SharedMemory>();
    if options.restart_epoch == 0 {
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc == -1 {
            unsafe { libc::close(fd) };
            bail!("cannot size shared memory region {name}");
        }
    }

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        bail!("cannot map shared memory region {name}");
    }

    let shmem = ptr as *mut SharedMemory;
    unsafe {
        if options.restart_epoch == 0 {
            (*shmem).size = size as u64;
            (*shmem).version = SHARED_MEMORY_VERSION;
            initialize_mutex(&mut (*shmem).log_lock);
            initialize_mutex(&mut (*shmem).access_log_lock);
            initialize_mutex(&mut (*shmem).stat_lock);
            initialize_mutex(&mut (*shmem).init_lock);
        } else {
            if (*shmem).size != size as u64 {
                bail!(
                    "shared memory size mismatch in {name}: region {} vs process {}",
                    (*shmem).size,
                    size
                );
            }
            if (*shmem).version != SHARED_MEMORY_VERSION {
                bail!(
                    "shared memory version mismatch in {name}: region {} vs process {}",
                    (*shmem).version,
                    SHARED_MEMORY_VERSION
                );
            }
        }
    }

    info!(region = %name, epoch = options.restart_epoch, "shared memory ready");
    Ok(shmem)
}

/// Stat allocator over the shared region's slot array.
pub struct ShmStatAllocator {
    shmem: *mut SharedMemory,
    lock: ProcessSharedMutex,
}

// The mapping is process-wide and immortal; access goes through the
// process-shared lock and slot atomics.
unsafe impl Send for ShmStatAllocator {}
unsafe impl Sync for ShmStatAllocator {}

impl RawStatAllocator for ShmStatAllocator {
    fn alloc(&self, name: &str) -> Option<StatDataRef> {
        self.lock.lock();
        let result = unsafe {
            let slots = &mut (*self.shmem).stats_slots;
            // Existing slot first so generations share series.
            let mut found = None;
            for slot in slots.iter() {
                if slot.initialized() && slot.matches(name) {
                    slot.ref_count.fetch_add(1, Ordering::Relaxed);
                    found = Some(StatDataRef::new(slot));
                    break;
                }
            }
            if found.is_none() {
                for slot in slots.iter_mut() {
                    if !slot.initialized() {
                        slot.initialize(name);
                        found = Some(StatDataRef::new(slot));
                        break;
                    }
                }
            }
            found
        };
        self.lock.unlock();
        result
    }

    fn free(&self, data: StatDataRef) {
        // The decrement races with a concurrent alloc without the lock.
        self.lock.lock();
        unsafe {
            let slot = data.raw() as *mut RawStatData;
            if (*slot).ref_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                (*slot).zero();
            }
        }
        self.lock.unlock();
    }
}

#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcMessageType {
    DrainListenersRequest = 1,
    GetListenSocketRequest = 2,
    GetListenSocketReply = 3,
    ShutdownAdminRequest = 4,
    ShutdownAdminReply = 5,
    TerminateRequest = 6,
    UnknownRequestReply = 7,
    GetStatsRequest = 8,
    GetStatsReply = 9,
}

/// Every message leads with its type and self-describing length.
#[repr(C)]
#[derive(Clone, Copy)]
struct RpcBase {
    type_: u64,
    length_: u64,
}

impl RpcBase {
    fn new<T>(type_: RpcMessageType) -> RpcBase {
        RpcBase {
            type_: type_ as u64,
            length_: mem::size_of::<T>() as u64,
        }
    }
}

const RPC_ADDRESS_LEN: usize = 256;

#[repr(C)]
#[derive(Clone, Copy)]
struct RpcGetListenSocketRequest {
    base: RpcBase,
    address: [u8; RPC_ADDRESS_LEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RpcGetListenSocketReply {
    base: RpcBase,
    fd: i32,
    _pad: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RpcShutdownAdminReply {
    base: RpcBase,
    original_start_time: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RpcGetStatsReply {
    base: RpcBase,
    memory_allocated: u64,
    num_connections: u64,
    unused: [u64; 16],
}

/// Raw byte view of a fixed-size plain-data RPC record.
fn rpc_bytes<T: Copy>(value: &T) -> &[u8] {
    // All RPC records are repr(C) with no padding requirements beyond what
    // the receive buffer provides.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// The callbacks a parent serves while a child generation starts up.
pub trait HotRestartServer {
    /// fd of the listening socket bound to `address`, if any.
    fn listen_socket_fd(&self, address: &str) -> Option<RawFd>;
    /// Close the admin surface; returns the first-epoch start time for
    /// continuous uptime reporting.
    fn shutdown_admin(&self) -> u64;
    /// (allocated stat memory, live connection count) for merged reporting
    /// during the overlap window.
    fn parent_stats(&self) -> (u64, u64);
    /// Begin graceful listener draining.
    fn drain_listeners(&self);
}

/// One generation's hot-restart endpoint: the mapped region plus the
/// datagram socket for its epoch slot.
pub struct HotRestart {
    restart_epoch: u64,
    shmem: *mut SharedMemory,
    my_domain_socket: RawFd,
    parent_address: libc::sockaddr_un,
    child_address: libc::sockaddr_un,
    parent_terminated: Cell<bool>,
    socket_event: RefCell<Option<FileEvent>>,
    server: RefCell<Weak<dyn HotRestartServer>>,
    rpc_buffer: RefCell<[u64; RPC_BUFFER_WORDS]>,
}

impl std::fmt::Debug for HotRestart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotRestart")
            .field("restart_epoch", &self.restart_epoch)
            .field("my_domain_socket", &self.my_domain_socket)
            .finish_non_exhaustive()
    }
}

impl HotRestart {
    pub fn new(options: &Options) -> Result<Rc<HotRestart>> {
        let shmem = initialize_shared_memory(options)?;

        let my_domain_socket = bind_domain_socket(options.base_id, options.restart_epoch)
            .with_context(|| {
                format!(
                    "unable to bind domain socket with id={} (see --base-id option)",
                    options.restart_epoch
                )
            })?;
        let child_address = domain_socket_address(options.base_id, options.restart_epoch + 1);
        let parent_address = if options.restart_epoch != 0 {
            domain_socket_address(options.base_id, options.restart_epoch - 1)
        } else {
            unsafe { mem::zeroed() }
        };

        // Never outlive the parent process tree: if the parent goes away we
        // are orphaned state and must exit.
        let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
        if rc == -1 {
            bail!("prctl(PR_SET_PDEATHSIG) failed");
        }

        let null_server: Weak<dyn HotRestartServer> = Weak::<NullServer>::new();
        Ok(Rc::new(HotRestart {
            restart_epoch: options.restart_epoch,
            shmem,
            my_domain_socket,
            parent_address,
            child_address,
            parent_terminated: Cell::new(false),
            socket_event: RefCell::new(None),
            server: RefCell::new(null_server),
            rpc_buffer: RefCell::new([0; RPC_BUFFER_WORDS]),
        }))
    }

    /// `<version>.<region size>`: both must match across generations.
    pub fn version(&self) -> String {
        format!("{}.{}", SHARED_MEMORY_VERSION, mem::size_of::<SharedMemory>())
    }

    /// Stat allocator backed by the shared slots.
    pub fn stat_allocator(&self) -> Arc<dyn RawStatAllocator> {
        Arc::new(ShmStatAllocator {
            shmem: self.shmem,
            lock: ProcessSharedMutex::new(unsafe { &mut (*self.shmem).stat_lock }),
        })
    }

    pub fn log_lock(&self) -> ProcessSharedMutex {
        ProcessSharedMutex::new(unsafe { &mut (*self.shmem).log_lock })
    }

    pub fn access_log_lock(&self) -> ProcessSharedMutex {
        ProcessSharedMutex::new(unsafe { &mut (*self.shmem).access_log_lock })
    }

    /// Start answering RPCs from the next generation on this loop.
    pub fn initialize(
        self: &Rc<Self>,
        dispatcher: &Rc<Dispatcher>,
        server: Weak<dyn HotRestartServer>,
    ) -> Result<()> {
        *self.server.borrow_mut() = server;
        let weak = Rc::downgrade(self);
        let event = dispatcher.create_file_event(
            self.my_domain_socket,
            Trigger::Edge,
            Ready::READ,
            move |_ready| {
                if let Some(hot_restart) = weak.upgrade() {
                    hot_restart.on_socket_event();
                }
            },
        )?;
        *self.socket_event.borrow_mut() = Some(event);
        Ok(())
    }

    /// Ask the parent to stop accepting. No reply.
    pub fn drain_parent_listeners(&self) {
        if self.restart_epoch == 0 {
            return;
        }
        let rpc = RpcBase::new::<RpcBase>(RpcMessageType::DrainListenersRequest);
        self.send_message(&self.parent_address, rpc_bytes(&rpc));
    }

    /// Ask the parent for its listening socket on `address`. The returned fd
    /// is a duplicate owned by this process; `None` when the parent has no
    /// such listener (or there is no parent).
    pub fn duplicate_parent_listen_socket(&self, address: &str) -> Option<RawFd> {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return None;
        }

        let mut rpc = RpcGetListenSocketRequest {
            base: RpcBase::new::<RpcGetListenSocketRequest>(RpcMessageType::GetListenSocketRequest),
            address: [0; RPC_ADDRESS_LEN],
        };
        let bytes = address.as_bytes();
        if bytes.len() >= RPC_ADDRESS_LEN {
            warn!(address, "listener address too long for hot restart");
            return None;
        }
        rpc.address[..bytes.len()].copy_from_slice(bytes);
        self.send_message(&self.parent_address, rpc_bytes(&rpc));

        let (type_, words, fd) = self.receive_rpc(true)?;
        assert_eq!(RpcMessageType::GetListenSocketReply as u64, type_);
        let reply: RpcGetListenSocketReply = unsafe { std::ptr::read(words.as_ptr() as *const _) };
        match fd {
            Some(received) => Some(received),
            None => {
                debug_assert_eq!(-1, reply.fd);
                None
            }
        }
    }

    /// Merged stats from the parent during overlap; zeros once it is gone.
    pub fn get_parent_stats(&self) -> (u64, u64) {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return (0, 0);
        }
        let rpc = RpcBase::new::<RpcBase>(RpcMessageType::GetStatsRequest);
        self.send_message(&self.parent_address, rpc_bytes(&rpc));
        let Some((type_, words, _)) = self.receive_rpc(true) else {
            return (0, 0);
        };
        assert_eq!(RpcMessageType::GetStatsReply as u64, type_);
        let reply: RpcGetStatsReply = unsafe { std::ptr::read(words.as_ptr() as *const _) };
        (reply.memory_allocated, reply.num_connections)
    }

    /// Close the parent's admin surface; returns its original first-epoch
    /// start time for continuous uptime reporting.
    pub fn shutdown_parent_admin(&self) -> Option<u64> {
        if self.restart_epoch == 0 {
            return None;
        }
        let rpc = RpcBase::new::<RpcBase>(RpcMessageType::ShutdownAdminRequest);
        self.send_message(&self.parent_address, rpc_bytes(&rpc));
        let (type_, words, _) = self.receive_rpc(true)?;
        assert_eq!(RpcMessageType::ShutdownAdminReply as u64, type_);
        let reply: RpcShutdownAdminReply = unsafe { std::ptr::read(words.as_ptr() as *const _) };
        Some(reply.original_start_time)
    }

    /// Tell the parent to exit. No reply; the parent signals itself.
    pub fn terminate_parent(&self) {
        if self.restart_epoch == 0 || self.parent_terminated.get() {
            return;
        }
        let rpc = RpcBase::new::<RpcBase>(RpcMessageType::TerminateRequest);
        self.send_message(&self.parent_address, rpc_bytes(&rpc));
        self.parent_terminated.set(true);
    }

    fn on_socket_event(&self) {
        loop {
            let Some((type_, words, _fd)) = self.receive_rpc(false) else {
                return;
            };
            let server = self.server.borrow().upgrade();
            let Some(server) = server else {
                continue;
            };

            match type_ {
                t if t == RpcMessageType::ShutdownAdminRequest as u64 => {
                    let reply = RpcShutdownAdminReply {
                        base: RpcBase::new::<RpcShutdownAdminReply>(
                            RpcMessageType::ShutdownAdminReply,
                        ),
                        original_start_time: server.shutdown_admin(),
                    };
                    self.send_message(&self.child_address, rpc_bytes(&reply));
                }

                t if t == RpcMessageType::GetListenSocketRequest as u64 => {
                    let request: RpcGetListenSocketRequest =
                        unsafe { std::ptr::read(words.as_ptr() as *const _) };
                    let len = request
                        .address
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(RPC_ADDRESS_LEN);
                    let address = String::from_utf8_lossy(&request.address[..len]).to_string();
                    self.on_get_listen_socket(&*server, &address);
                }

                t if t == RpcMessageType::GetStatsRequest as u64 => {
                    let (memory_allocated, num_connections) = server.parent_stats();
                    let reply = RpcGetStatsReply {
                        base: RpcBase::new::<RpcGetStatsReply>(RpcMessageType::GetStatsReply),
                        memory_allocated,
                        num_connections,
                        unused: [0; 16],
                    };
                    self.send_message(&self.child_address, rpc_bytes(&reply));
                }

                t if t == RpcMessageType::DrainListenersRequest as u64 => {
                    server.drain_listeners();
                }

                t if t == RpcMessageType::TerminateRequest as u64 => {
                    warn!("shutting down due to child request");
                    unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
                }

                _ => {
                    // Forward-incompatible senders still get an answer so
                    // they never deadlock on us.
                    let reply = RpcBase::new::<RpcBase>(RpcMessageType::UnknownRequestReply);
                    self.send_message(&self.child_address, rpc_bytes(&reply));
                }
            }
        }
    }

    fn on_get_listen_socket(&self, server: &dyn HotRestartServer, address: &str) {
        let fd = server.listen_socket_fd(address).unwrap_or(-1);
        let reply = RpcGetListenSocketReply {
            base: RpcBase::new::<RpcGetListenSocketReply>(RpcMessageType::GetListenSocketReply),
            fd,
            _pad: 0,
        };

        if fd == -1 {
            // Nothing to duplicate; a plain reply says so.
            self.send_message(&self.child_address, rpc_bytes(&reply));
            return;
        }

        // The fd travels in ancillary data; the kernel duplicates it into
        // the receiver.
        let bytes = rpc_bytes(&reply);
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let mut control = [0u8; 64];
        let control_len = unsafe { libc::CMSG_SPACE(mem::size_of::<i32>() as u32) } as usize;
        let mut message: libc::msghdr = unsafe { mem::zeroed() };
        message.msg_name = &self.child_address as *const _ as *mut libc::c_void;
        message.msg_namelen = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        message.msg_iov = &mut iov;
        message.msg_iovlen = 1;
        message.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        message.msg_controllen = control_len;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&message);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<i32>() as u32) as usize;
            std::ptr::write(libc::CMSG_DATA(cmsg) as *mut i32, fd);

            let rc = libc::sendmsg(self.my_domain_socket, &message, 0);
            if rc == -1 {
                warn!(
                    error = %std::io::Error::last_os_error(),
                    "failed to pass listen socket to child"
                );
            }
        }
    }

    /// Receive one datagram. Blocking mode is used for synchronous replies;
    /// non-blocking `EAGAIN` yields `None`. Returns the message type, the
    /// raw words, and a received fd if ancillary data carried one.
    fn receive_rpc(&self, block: bool) -> Option<(u64, [u64; RPC_BUFFER_WORDS], Option<RawFd>)> {
        if block {
            set_blocking(self.my_domain_socket, true);
        }

        let mut buffer = self.rpc_buffer.borrow_mut();
        let mut iov = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: mem::size_of_val(&*buffer),
        };
        let mut control = [0u8; 64];
        let control_len = unsafe { libc::CMSG_SPACE(mem::size_of::<i32>() as u32) } as usize;
        let mut message: libc::msghdr = unsafe { mem::zeroed() };
        message.msg_iov = &mut iov;
        message.msg_iovlen = 1;
        message.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        message.msg_controllen = control_len;

        let rc = unsafe { libc::recvmsg(self.my_domain_socket, &mut message, 0) };
        if !block && rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return None;
            }
        }
        assert!(rc != -1, "hot restart recvmsg failed");

        if block {
            set_blocking(self.my_domain_socket, false);
        }

        let base: RpcBase = unsafe { std::ptr::read(buffer.as_ptr() as *const _) };
        assert_eq!(
            rc as u64, base.length_,
            "hot restart message length mismatch"
        );

        let mut received_fd = None;
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&message);
            if !cmsg.is_null()
                && (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                // Only the listen-socket reply carries an fd.
                assert_eq!(RpcMessageType::GetListenSocketReply as u64, base.type_);
                received_fd = Some(std::ptr::read(libc::CMSG_DATA(cmsg) as *const i32));
            }
        }

        Some((base.type_, *buffer, received_fd))
    }

    fn send_message(&self, address: &libc::sockaddr_un, bytes: &[u8]) {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let mut message: libc::msghdr = unsafe { mem::zeroed() };
        message.msg_name = address as *const _ as *mut libc::c_void;
        message.msg_namelen = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        message.msg_iov = &mut iov;
        message.msg_iovlen = 1;

        let rc = unsafe { libc::sendmsg(self.my_domain_socket, &message, 0) };
        if rc == -1 {
            // The peer generation may be gone; callers treat silence as
            // "no parent".
            debug!(
                error = %std::io::Error::last_os_error(),
                "hot restart sendmsg failed"
            );
        }
    }
}

impl Drop for HotRestart {
    fn drop(&mut self) {
        unsafe { libc::close(self.my_domain_socket) };
    }
}

/// Placeholder so the server weak slot has a concrete type before
/// `initialize` installs the real one.
struct NullServer;

impl HotRestartServer for NullServer {
    fn listen_socket_fd(&self, _address: &str) -> Option<RawFd> {
        None
    }
    fn shutdown_admin(&self) -> u64 {
        0
    }
    fn parent_stats(&self) -> (u64, u64) {
        (0, 0)
    }
    fn drain_listeners(&self) {}
}

/// Abstract-namespace address for a generation slot: the name starts with a
/// NUL and never touches the filesystem.
fn domain_socket_address(base_id: u64, id: u64) -> libc::sockaddr_un {
    let id = id % MAX_CONCURRENT_PROCESSES;
    let mut address: libc::sockaddr_un = unsafe { mem::zeroed() };
    address.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let name = format!("relayd_domain_socket_{}", base_id + id);
    for (i, b) in name.as_bytes().iter().enumerate() {
        address.sun_path[i + 1] = *b as libc::c_char;
    }
    address
}

fn bind_domain_socket(base_id: u64, id: u64) -> Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd == -1 {
        bail!("cannot create hot restart socket");
    }

    let address = domain_socket_address(base_id, id);
    let rc = unsafe {
        libc::bind(
            fd,
            &address as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("cannot bind hot restart socket: {err}");
    }
    Ok(fd)
}

fn set_blocking(fd: RawFd, blocking: bool) {
    let flags = if blocking { 0 } else { libc::O_NONBLOCK };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    assert!(rc != -1, "fcntl on hot restart socket failed");
}

#[cfg(test)]
mod tests;
