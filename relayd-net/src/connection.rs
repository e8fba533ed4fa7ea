//! Buffered, flow-controlled TCP/TLS connections.
//!
//! A [`Connection`] is a bidirectional byte pipe driven entirely by the
//! owning worker's event loop. Reads accumulate into a watermarked buffer and
//! are offered to the read filter chain in arrival order; writes pass the
//! write filters, join the write buffer, and drain to the socket in
//! submission order. TLS connections run their handshake asynchronously and
//! only raise `Connected` once it succeeds.
//!
//! The handle is a cheap clone over shared state; everything underneath is
//! single-threaded. Event callbacks are dispatched after the internal borrow
//! is released, so a callback may freely call back into the connection.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::event::{Dispatcher, FileEvent, Ready, Trigger};
use crate::filter::{ConnectionOps, FilterStatus, ReadFilter, WriteFilter};
use crate::tls::{ClientTlsContext, HandshakeResult, ServerTlsContext, TlsSession};
use crate::DEFAULT_READ_BUFFER_LIMIT;

/// Single read() sip. The watermark check runs between sips, so a buffer
/// limit that is a multiple of this value fills to exactly the limit.
const READ_SLICE_SIZE: usize = 16384;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Drop pending writes and close immediately.
    NoFlush,
    /// Drain the write buffer, then close.
    FlushWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    LocalClose,
    RemoteClose,
}

/// Observer for connection lifecycle events.
pub trait ConnectionCallbacks {
    fn on_event(&self, event: ConnectionEvent);
}

/// Peer certificate details of a TLS connection.
pub struct SslInfo {
    digest: String,
    uri_san: String,
}

impl SslInfo {
    /// Lowercase-hex SHA-256 of the peer certificate; empty without one.
    pub fn sha256_peer_certificate_digest(&self) -> String {
        self.digest.clone()
    }

    /// URI subjectAltName of the peer certificate; empty without a peer
    /// certificate, SAN extension, or URI entry.
    pub fn uri_san_peer_certificate(&self) -> String {
        self.uri_san.clone()
    }
}

enum PostIoAction {
    KeepOpen,
    Close,
}

pub(crate) struct ConnectionInner {
    id: u64,
    sock: TcpStream,
    tls: Option<TlsSession>,
    state: State,
    /// Client connection still waiting for connect() to finish.
    connecting: bool,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    read_buffer: BytesMut,
    read_buffer_limit: usize,
    read_disabled: bool,
    /// Reading stopped at the watermark with kernel data likely remaining;
    /// reschedule a read once filters drain.
    read_resume_wanted: bool,
    write_buffer: BytesMut,
    close_after_flush: bool,
    read_filters: Vec<Box<dyn ReadFilter>>,
    write_filters: Vec<Box<dyn WriteFilter>>,
    callbacks: Vec<Rc<dyn ConnectionCallbacks>>,
    file_event: Option<FileEvent>,
    pending_events: Vec<ConnectionEvent>,
}

impl ConnectionInner {
    fn on_ready(&mut self, ready: Ready) {
        trace!(conn_id = self.id, ?ready, "connection event");

        if self.state == State::Closed {
            return;
        }

        if self.connecting {
            if !(ready.is_writable() || ready.is_closed()) {
                return;
            }
            match self.sock.take_error() {
                Ok(None) if ready.is_writable() => {
                    self.connecting = false;
                    if self.tls.is_none() {
                        self.pending_events.push(ConnectionEvent::Connected);
                    }
                }
                _ => {
                    debug!(conn_id = self.id, "connect failed");
                    self.finish_close(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        if let Some(tls) = self.tls.as_mut() {
            if tls.is_handshaking() {
                match tls.advance_handshake(&mut self.sock) {
                    HandshakeResult::InProgress => return,
                    HandshakeResult::Complete => {
                        self.pending_events.push(ConnectionEvent::Connected);
                        if self.state != State::Open {
                            return;
                        }
                    }
                    HandshakeResult::Failed(reason) => {
                        debug!(conn_id = self.id, %reason, "tls handshake failed");
                        self.finish_close(ConnectionEvent::RemoteClose);
                        return;
                    }
                }
            }
        }

        if ready.is_writable() || ready.is_closed() {
            self.do_write();
            if self.state == State::Closed {
                return;
            }
        }

        if ready.is_readable() || ready.is_closed() {
            self.do_read();
        }
    }

    /// Fill the read buffer up to the watermark, dispatch filters, repeat via
    /// activation while kernel data remains.
    fn do_read(&mut self) {
        if self.state != State::Open || self.read_disabled {
            return;
        }

        let limit = if self.read_buffer_limit == 0 {
            usize::MAX
        } else {
            self.read_buffer_limit
        };

        let mut end_stream = false;
        let mut action = PostIoAction::KeepOpen;

        loop {
            let room = limit.saturating_sub(self.read_buffer.len());
            if room == 0 {
                self.read_resume_wanted = true;
                break;
            }

            let sip = room.min(READ_SLICE_SIZE);
            let old_len = self.read_buffer.len();
            self.read_buffer.resize(old_len + sip, 0);
            let result = match self.tls.as_mut() {
                Some(tls) => tls.read_plaintext(&mut self.sock, &mut self.read_buffer[old_len..]),
                None => self.sock.read(&mut self.read_buffer[old_len..]),
            };

            match result {
                Ok(0) => {
                    self.read_buffer.truncate(old_len);
                    end_stream = true;
                    break;
                }
                Ok(n) => {
                    self.read_buffer.truncate(old_len + n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.read_buffer.truncate(old_len);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.read_buffer.truncate(old_len);
                }
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "read error");
                    self.read_buffer.truncate(old_len);
                    action = PostIoAction::Close;
                    break;
                }
            }
        }

        self.dispatch_read_filters();

        if self.read_resume_wanted
            && self.state == State::Open
            && !self.read_disabled
            && self.read_buffer.len() < limit
        {
            self.read_resume_wanted = false;
            if let Some(event) = self.file_event.as_ref() {
                event.activate(Ready::READ);
            }
        }

        if end_stream || matches!(action, PostIoAction::Close) {
            self.finish_close(ConnectionEvent::RemoteClose);
        }
    }

    fn dispatch_read_filters(&mut self) {
        if self.read_buffer.is_empty() {
            return;
        }

        let mut filters = std::mem::take(&mut self.read_filters);
        for filter in filters.iter_mut() {
            if self.state != State::Open {
                break;
            }
            let mut data = std::mem::take(&mut self.read_buffer);
            let status = filter.on_data(&mut data, self);
            self.read_buffer = data;
            if status == FilterStatus::StopIteration {
                break;
            }
        }
        // Filters appended during dispatch go after the existing chain.
        let added = std::mem::take(&mut self.read_filters);
        self.read_filters = filters;
        self.read_filters.extend(added);
    }

    fn dispatch_new_connection(&mut self) {
        let mut filters = std::mem::take(&mut self.read_filters);
        for filter in filters.iter_mut() {
            if self.state != State::Open {
                break;
            }
            if filter.on_new_connection(self) == FilterStatus::StopIteration {
                break;
            }
        }
        let added = std::mem::take(&mut self.read_filters);
        self.read_filters = filters;
        self.read_filters.extend(added);
    }

    fn write_internal(&mut self, data: &[u8]) {
        if self.state != State::Open {
            trace!(conn_id = self.id, "discarding write on non-open connection");
            return;
        }

        let mut buf = BytesMut::from(data);
        let mut filters = std::mem::take(&mut self.write_filters);
        for filter in filters.iter_mut() {
            if filter.on_write(&mut buf) == FilterStatus::StopIteration {
                break;
            }
        }
        let added = std::mem::take(&mut self.write_filters);
        self.write_filters = filters;
        self.write_filters.extend(added);

        self.write_buffer.extend_from_slice(&buf);
        if !self.connecting {
            self.do_write();
        }
    }

    fn do_write(&mut self) {
        if self.state == State::Closed || self.connecting {
            return;
        }

        while !self.write_buffer.is_empty() {
            let result = match self.tls.as_mut() {
                Some(tls) => tls.write_plaintext(&mut self.sock, &self.write_buffer),
                None => self.sock.write(&self.write_buffer),
            };

            match result {
                Ok(0) => return, // transport buffer full; retry on writable
                Ok(n) => {
                    let _ = self.write_buffer.split_to(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "write error");
                    self.finish_close(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        // Plaintext drained; for TLS there may still be queued records.
        if let Some(tls) = self.tls.as_mut() {
            match tls.flush_records(&mut self.sock) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    debug!(conn_id = self.id, error = %e, "tls flush error");
                    self.finish_close(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        if self.state == State::Closing && self.close_after_flush {
            if let Some(tls) = self.tls.as_mut() {
                if !tls.is_handshaking() {
                    tls.send_close_notify(&mut self.sock);
                }
            }
            self.finish_close(ConnectionEvent::LocalClose);
        }
    }

    fn close_internal(&mut self, close_type: CloseType) {
        match self.state {
            State::Closed => return,
            State::Closing if close_type == CloseType::FlushWrite => return,
            _ => {}
        }

        debug!(conn_id = self.id, ?close_type, "closing connection");
        match close_type {
            CloseType::NoFlush => {
                self.write_buffer.clear();
                self.finish_close(ConnectionEvent::LocalClose);
            }
            CloseType::FlushWrite => {
                if self.connecting {
                    self.finish_close(ConnectionEvent::LocalClose);
                    return;
                }
                self.state = State::Closing;
                self.close_after_flush = true;
                self.read_disabled = true;
                // Completes inline when nothing is actually buffered.
                self.do_write();
            }
        }
    }

    fn finish_close(&mut self, event: ConnectionEvent) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        self.file_event = None;
        let _ = self.sock.shutdown(std::net::Shutdown::Both);
        self.pending_events.push(event);
    }
}

impl ConnectionOps for ConnectionInner {
    fn write(&mut self, data: &[u8]) {
        self.write_internal(data);
    }

    fn close(&mut self, close_type: CloseType) {
        self.close_internal(close_type);
    }

    fn read_disable(&mut self, disable: bool) {
        self.read_disabled = disable;
        if !disable {
            if let Some(event) = self.file_event.as_ref() {
                event.activate(Ready::READ);
            }
        }
    }

    fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    fn id(&self) -> u64 {
        self.id
    }
}

/// Handle to one connection. Clones share state; the connection lives until
/// every handle is gone and any scheduled teardown has run.
///
/// Writes issued while the connection is dispatching its own callbacks (a
/// response-completion handler encoding the next request, for instance) are
/// staged and flushed the moment the dispatch unwinds, preserving submission
/// order.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnectionInner>>,
    staged_writes: Rc<RefCell<BytesMut>>,
}

impl Connection {
    /// Wrap an accepted socket. TLS connections begin their server handshake
    /// on first readiness.
    pub fn new_server(
        dispatcher: &Rc<Dispatcher>,
        sock: TcpStream,
        remote_address: SocketAddr,
        local_address: SocketAddr,
        tls: Option<&ServerTlsContext>,
    ) -> Result<Connection, crate::Error> {
        let session = match tls {
            Some(ctx) => Some(TlsSession::new_server(ctx)?),
            None => None,
        };
        Self::build(dispatcher, sock, remote_address, local_address, session, false)
    }

    /// Open a client connection; `Connected` is raised once the non-blocking
    /// connect (and TLS handshake, if any) completes.
    pub fn connect(
        dispatcher: &Rc<Dispatcher>,
        address: SocketAddr,
    ) -> Result<Connection, crate::Error> {
        let sock = TcpStream::connect(address)?;
        Self::build(dispatcher, sock, address, unspecified_addr(address), None, true)
    }

    /// Open a TLS client connection.
    pub fn connect_tls(
        dispatcher: &Rc<Dispatcher>,
        address: SocketAddr,
        ctx: &ClientTlsContext,
        server_name: &str,
    ) -> Result<Connection, crate::Error> {
        let sock = TcpStream::connect(address)?;
        let session = TlsSession::new_client(ctx, server_name)?;
        Self::build(
            dispatcher,
            sock,
            address,
            unspecified_addr(address),
            Some(session),
            true,
        )
    }

    /// Adopt a raw accepted fd (listener and proxy-protocol path).
    pub(crate) fn from_accepted_fd(
        dispatcher: &Rc<Dispatcher>,
        fd: std::os::fd::RawFd,
        remote_address: SocketAddr,
        local_address: SocketAddr,
        tls: Option<&ServerTlsContext>,
    ) -> Result<Connection, crate::Error> {
        let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        std_stream.set_nonblocking(true)?;
        let sock = TcpStream::from_std(std_stream);
        Connection::new_server(dispatcher, sock, remote_address, local_address, tls)
    }

    fn build(
        dispatcher: &Rc<Dispatcher>,
        sock: TcpStream,
        remote_address: SocketAddr,
        local_address: SocketAddr,
        tls: Option<TlsSession>,
        connecting: bool,
    ) -> Result<Connection, crate::Error> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        // An explicit local address wins: an intercepted connection reports
        // its original destination, not the socket's own address.
        let local_address = if local_address.ip().is_unspecified() && local_address.port() == 0 {
            sock.local_addr().unwrap_or(local_address)
        } else {
            local_address
        };

        let inner = Rc::new(RefCell::new(ConnectionInner {
            id,
            sock,
            tls,
            state: State::Open,
            connecting,
            local_address,
            remote_address,
            read_buffer: BytesMut::new(),
            read_buffer_limit: DEFAULT_READ_BUFFER_LIMIT,
            read_disabled: false,
            read_resume_wanted: false,
            write_buffer: BytesMut::new(),
            close_after_flush: false,
            read_filters: Vec::new(),
            write_filters: Vec::new(),
            callbacks: Vec::new(),
            file_event: None,
            pending_events: Vec::new(),
        }));

        let connection = Connection {
            inner,
            staged_writes: Rc::new(RefCell::new(BytesMut::new())),
        };

        let fd = connection.inner.borrow().sock.as_raw_fd();
        let weak = Rc::downgrade(&connection.inner);
        let staged = Rc::downgrade(&connection.staged_writes);
        let event = dispatcher.create_file_event(
            fd,
            Trigger::Edge,
            Ready::READ | Ready::WRITE,
            move |ready| {
                if let (Some(inner), Some(staged_writes)) = (weak.upgrade(), staged.upgrade()) {
                    let connection = Connection {
                        inner,
                        staged_writes,
                    };
                    connection.handle_ready(ready);
                }
            },
        )?;
        connection.inner.borrow_mut().file_event = Some(event);

        debug!(conn_id = id, remote = %remote_address, connecting, "connection created");
        Ok(connection)
    }

    fn handle_ready(&self, ready: Ready) {
        self.inner.borrow_mut().on_ready(ready);
        self.try_flush_staged();
        self.flush_events();
    }

    /// Move staged writes into the connection proper. Returns false when the
    /// connection is mid-dispatch; the unwinding dispatch flushes instead.
    fn try_flush_staged(&self) -> bool {
        loop {
            let Ok(mut inner) = self.inner.try_borrow_mut() else {
                return false;
            };
            let data = {
                let mut staged = self.staged_writes.borrow_mut();
                if staged.is_empty() {
                    return true;
                }
                staged.split()
            };
            inner.write_internal(&data);
        }
    }

    /// Dispatch queued lifecycle events with no internal borrow held, so
    /// callbacks may call back into the connection.
    fn flush_events(&self) {
        loop {
            let events: Vec<ConnectionEvent> = {
                let mut inner = self.inner.borrow_mut();
                if inner.pending_events.is_empty() {
                    break;
                }
                inner.pending_events.drain(..).collect()
            };
            let callbacks = self.inner.borrow().callbacks.clone();
            for event in events {
                trace!(conn_id = self.id(), ?event, "raising event");
                for cb in &callbacks {
                    cb.on_event(event);
                }
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    pub fn local_address(&self) -> SocketAddr {
        self.inner.borrow().local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.borrow().remote_address
    }

    pub fn add_read_filter(&self, filter: Box<dyn ReadFilter>) {
        self.inner.borrow_mut().read_filters.push(filter);
    }

    pub fn add_write_filter(&self, filter: Box<dyn WriteFilter>) {
        self.inner.borrow_mut().write_filters.push(filter);
    }

    pub fn add_connection_callbacks(&self, callbacks: Rc<dyn ConnectionCallbacks>) {
        self.inner.borrow_mut().callbacks.push(callbacks);
    }

    /// Run `on_new_connection` through the read filter chain. The handler
    /// calls this once the chain is fully built.
    pub fn init_filters(&self) {
        self.inner.borrow_mut().dispatch_new_connection();
        self.flush_events();
    }

    pub fn write(&self, data: &[u8]) {
        self.staged_writes.borrow_mut().extend_from_slice(data);
        if self.try_flush_staged() {
            self.flush_events();
        }
    }

    pub fn close(&self, close_type: CloseType) {
        self.inner.borrow_mut().close_internal(close_type);
        self.flush_events();
    }

    pub fn set_no_delay(&self, enabled: bool) {
        let _ = self.inner.borrow().sock.set_nodelay(enabled);
    }

    /// Read watermark; zero means the built-in default.
    pub fn set_read_buffer_limit(&self, limit: usize) {
        self.inner.borrow_mut().read_buffer_limit = if limit == 0 {
            DEFAULT_READ_BUFFER_LIMIT
        } else {
            limit
        };
    }

    pub fn read_buffer_limit(&self) -> usize {
        self.inner.borrow().read_buffer_limit
    }

    pub fn read_disable(&self, disable: bool) {
        self.inner.borrow_mut().read_disable(disable);
    }

    /// Peer certificate info for TLS connections, `None` for plain TCP.
    pub fn ssl(&self) -> Option<SslInfo> {
        let inner = self.inner.borrow();
        inner.tls.as_ref().map(|tls| SslInfo {
            digest: tls.sha256_peer_certificate_digest(),
            uri_san: tls.uri_san_peer_certificate(),
        })
    }
}

fn unspecified_addr(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
