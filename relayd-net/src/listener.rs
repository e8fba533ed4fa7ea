//! Accepting listeners.
//!
//! A [`Listener`] drains its listen socket on readiness and turns each
//! accepted fd into a [`Connection`] for its callbacks, after optionally
//! recovering the original destination of an intercepted connection (and
//! rehoming it to the listener registered for that address), reading a
//! PROXY protocol v1 header, and running the TLS server handshake.
//!
//! An accept error means the process has either exhausted fds or lost the
//! listen socket underneath the loop; neither is recoverable at this layer,
//! so the process aborts with a recognisable diagnostic.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use slab::Slab;
use tracing::{debug, error, info};

use crate::connection::Connection;
use crate::event::{Dispatcher, FileEvent, Ready, Trigger};
use crate::proxy_proto::{parse_proxy_line, ProxyLineReader, ProxyLineResult};
use crate::socket::{original_dst, sockaddr_to_addr, ListenSocket};
use crate::tls::ServerTlsContext;
use crate::{Error, DEFAULT_READ_BUFFER_LIMIT};

/// Recognised listener options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// Accept on the socket; false leaves the listener as a pure address
    /// anchor for original-destination rehoming.
    pub bind_to_port: bool,
    /// Consume a PROXY protocol v1 line before any filter sees bytes.
    pub use_proxy_proto: bool,
    /// Recover the pre-redirect destination and rehome the connection onto
    /// the listener registered for it.
    pub use_original_dst: bool,
    /// Read watermark; zero selects the 1 MiB default.
    pub per_connection_buffer_limit_bytes: usize,
}

/// Receives the connections a listener constructs.
pub trait ListenerCallbacks {
    fn on_new_connection(&self, connection: Connection);
}

/// The slice of the connection handler a listener needs: resolving an
/// original destination address to a peer listener.
pub trait ConnectionHandler {
    fn find_listener_by_address(&self, address: SocketAddr) -> Option<Listener>;
}

struct PendingProxyConn {
    fd: RawFd,
    reader: ProxyLineReader,
    local_address: SocketAddr,
    _file_event: FileEvent,
}

impl Drop for PendingProxyConn {
    fn drop(&mut self) {
        if self.fd != -1 {
            unsafe { libc::close(self.fd) };
        }
    }
}

pub(crate) struct ListenerInner {
    dispatcher: Rc<Dispatcher>,
    socket: Arc<ListenSocket>,
    handler: Weak<dyn ConnectionHandler>,
    callbacks: Weak<dyn ListenerCallbacks>,
    options: ListenerOptions,
    tls: Option<ServerTlsContext>,
    proxy_proto_error: relayd_stats::Counter,
    proxy_pending: RefCell<Slab<PendingProxyConn>>,
    accept_event: RefCell<Option<FileEvent>>,
    /// Original-destination lookup, replaceable so transparent-proxy tests
    /// can run without an iptables REDIRECT in front of them.
    original_dst_resolver: RefCell<Box<dyn Fn(RawFd) -> Option<SocketAddr>>>,
}

/// Accepting listener handle. Clones share the listener.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    pub fn new(
        dispatcher: &Rc<Dispatcher>,
        handler: Weak<dyn ConnectionHandler>,
        socket: Arc<ListenSocket>,
        callbacks: Weak<dyn ListenerCallbacks>,
        scope: &relayd_stats::Scope,
        options: ListenerOptions,
        tls: Option<ServerTlsContext>,
    ) -> Result<Listener, Error> {
        let inner = Rc::new(ListenerInner {
            dispatcher: Rc::clone(dispatcher),
            socket,
            handler,
            callbacks,
            options,
            tls,
            proxy_proto_error: scope.counter("downstream_cx_proxy_proto_error"),
            proxy_pending: RefCell::new(Slab::new()),
            accept_event: RefCell::new(None),
            original_dst_resolver: RefCell::new(Box::new(original_dst)),
        });

        let listener = Listener { inner };

        if options.bind_to_port {
            let weak = Rc::downgrade(&listener.inner);
            let event = dispatcher.create_file_event(
                listener.inner.socket.fd(),
                Trigger::Edge,
                Ready::READ,
                move |_ready| {
                    if let Some(inner) = weak.upgrade() {
                        Listener { inner }.on_accept_ready();
                    }
                },
            )?;
            *listener.inner.accept_event.borrow_mut() = Some(event);
            info!(addr = %listener.inner.socket.local_address(), "listener accepting");
        }

        Ok(listener)
    }

    pub fn local_address(&self) -> SocketAddr {
        self.inner.socket.local_address()
    }

    pub fn options(&self) -> ListenerOptions {
        self.inner.options
    }

    /// Stop accepting. Existing connections are untouched.
    pub fn disable(&self) {
        *self.inner.accept_event.borrow_mut() = None;
    }

    /// Replace the original-destination lookup. Test seam for redirected
    /// traffic; production uses the kernel query installed by default.
    pub fn set_original_dst_resolver(
        &self,
        resolver: impl Fn(RawFd) -> Option<SocketAddr> + 'static,
    ) {
        *self.inner.original_dst_resolver.borrow_mut() = Box::new(resolver);
    }

    fn on_accept_ready(&self) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.inner.socket.fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };

            if fd < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return,
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    _ => {
                        // Out of fds or the listen socket is gone; neither is
                        // survivable here.
                        error!(addr = %self.local_address(), error = %err,
                               "listener accept failure");
                        std::process::abort();
                    }
                }
            }

            let remote_address = match sockaddr_to_addr(&storage) {
                Some(addr) => addr,
                None => {
                    unsafe { libc::close(fd) };
                    continue;
                }
            };

            self.handle_accepted(fd, remote_address);
        }
    }

    fn handle_accepted(&self, fd: RawFd, remote_address: SocketAddr) {
        let mut target = self.clone();
        let mut local_address = self.inner.socket.local_address();

        if self.inner.options.use_original_dst {
            if let Some(dst) = (self.inner.original_dst_resolver.borrow())(fd) {
                // A connection that was not redirected reports the listener's
                // own address; only a differing address means interception.
                if dst != local_address {
                    local_address = dst;
                    if let Some(handler) = self.inner.handler.upgrade() {
                        if let Some(other) = handler.find_listener_by_address(dst) {
                            target = other;
                        }
                    }
                }
            }
        }

        if target.inner.options.use_proxy_proto {
            target.start_proxy_protocol(fd, local_address);
        } else {
            target.new_connection(fd, remote_address, local_address);
        }
    }

    /// Park the fd until a full PROXY line arrives, then admit it with the
    /// advertised source as its remote address.
    fn start_proxy_protocol(&self, fd: RawFd, local_address: SocketAddr) {
        let weak = Rc::downgrade(&self.inner);
        let mut pending = self.inner.proxy_pending.borrow_mut();
        let entry = pending.vacant_entry();
        let key = entry.key();

        let event = match self.inner.dispatcher.create_file_event(
            fd,
            Trigger::Edge,
            Ready::READ,
            move |_ready| {
                if let Some(inner) = weak.upgrade() {
                    Listener { inner }.on_proxy_proto_ready(key);
                }
            },
        ) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "failed to watch proxy-protocol socket");
                unsafe { libc::close(fd) };
                return;
            }
        };

        entry.insert(PendingProxyConn {
            fd,
            reader: ProxyLineReader::new(),
            local_address,
            _file_event: event,
        });
        drop(pending);

        // The line may already be sitting in the kernel.
        self.on_proxy_proto_ready(key);
    }

    fn on_proxy_proto_ready(&self, key: usize) {
        let result = {
            let mut pending = self.inner.proxy_pending.borrow_mut();
            let Some(conn) = pending.get_mut(key) else {
                return;
            };
            conn.reader.read_line(conn.fd)
        };

        match result {
            ProxyLineResult::Again => {}
            ProxyLineResult::Line(line) => {
                let mut pending = self.inner.proxy_pending.borrow_mut();
                let mut conn = pending.remove(key);
                drop(pending);
                match parse_proxy_line(&line) {
                    Some(remote_address) => {
                        let fd = conn.fd;
                        conn.fd = -1; // ownership moves to the connection
                        let local_address = conn.local_address;
                        drop(conn);
                        self.new_connection(fd, remote_address, local_address);
                    }
                    None => {
                        debug!("malformed proxy protocol line");
                        self.inner.proxy_proto_error.inc();
                    }
                }
            }
            ProxyLineResult::Error => {
                self.inner.proxy_proto_error.inc();
                self.inner.proxy_pending.borrow_mut().remove(key);
            }
        }
    }

    fn new_connection(&self, fd: RawFd, remote_address: SocketAddr, local_address: SocketAddr) {
        let connection = match Connection::from_accepted_fd(
            &self.inner.dispatcher,
            fd,
            remote_address,
            local_address,
            self.inner.tls.as_ref(),
        ) {
            Ok(connection) => connection,
            Err(e) => {
                debug!(error = %e, "failed to wrap accepted socket");
                return;
            }
        };

        let limit = self.inner.options.per_connection_buffer_limit_bytes;
        connection.set_read_buffer_limit(if limit == 0 {
            DEFAULT_READ_BUFFER_LIMIT
        } else {
            limit
        });

        match self.inner.callbacks.upgrade() {
            Some(callbacks) => callbacks.on_new_connection(connection),
            None => connection.close(crate::CloseType::NoFlush),
        }
    }
}
