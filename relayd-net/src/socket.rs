//! Listening socket ownership and low-level socket queries.
//!
//! A [`ListenSocket`] either binds a fresh TCP socket or adopts a file
//! descriptor handed over by the previous process generation. Construction
//! uses socket2 for the standard knobs and drops to raw libc for the options
//! socket2 has no wrapper for.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::address::resolve_url;
use crate::Error;

const LISTEN_BACKLOG: i32 = 1024;

/// An owned listening socket with its resolved local address.
#[derive(Debug)]
pub struct ListenSocket {
    socket: Socket,
    local_address: SocketAddr,
}

impl ListenSocket {
    /// Bind a fresh TCP socket from a `tcp://host:port` URL. With
    /// `bind_to_port` false the socket is created but neither bound nor
    /// listening; such sockets only anchor an address in the handler's
    /// listener map.
    pub fn bind_url(url: &str, bind_to_port: bool) -> Result<ListenSocket, Error> {
        Self::bind(resolve_url(url)?, bind_to_port)
    }

    /// Bind `0.0.0.0:port`.
    pub fn bind_port(port: u16, bind_to_port: bool) -> Result<ListenSocket, Error> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port)), bind_to_port)
    }

    pub fn bind(addr: SocketAddr, bind_to_port: bool) -> Result<ListenSocket, Error> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;

        let mut local_address = addr;
        if bind_to_port {
            socket
                .bind(&addr.into())
                .map_err(|source| Error::Bind { addr, source })?;
            socket
                .listen(LISTEN_BACKLOG)
                .map_err(|source| Error::Listen { addr, source })?;
            // Re-resolve for ephemeral port binds.
            if let Some(resolved) = socket.local_addr()?.as_socket() {
                local_address = resolved;
            }
        }

        debug!(addr = %local_address, bound = bind_to_port, "listen socket created");

        Ok(ListenSocket {
            socket,
            local_address,
        })
    }

    /// Adopt an already-listening fd inherited from the parent generation.
    pub fn from_inherited_fd(fd: RawFd) -> Result<ListenSocket, Error> {
        // Ownership of the fd transfers here; the parent sent a duplicate.
        let socket = unsafe { Socket::from_raw_fd(fd) };
        socket.set_nonblocking(true)?;
        let local_address = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::InvalidAddress(format!("inherited fd {fd} is not a TCP socket")))?;

        debug!(addr = %local_address, fd, "listen socket inherited");

        Ok(ListenSocket {
            socket,
            local_address,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }
}

/// `SO_ORIGINAL_DST` from `<linux/netfilter_ipv4.h>`; libc carries no
/// constant for it.
#[cfg(target_os = "linux")]
const SO_ORIGINAL_DST: libc::c_int = 80;

/// Recover the pre-redirect destination of an intercepted connection.
///
/// Returns `None` when the connection was not redirected (or the platform
/// cannot tell), in which case the listener keeps its own local address.
#[cfg(target_os = "linux")]
pub fn original_dst(fd: RawFd) -> Option<SocketAddr> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }

    let ip = u32::from_be(addr.sin_addr.s_addr);
    let port = u16::from_be(addr.sin_port);
    Some(SocketAddr::from((ip.to_be_bytes(), port)))
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_fd: RawFd) -> Option<SocketAddr> {
    None
}

/// Convert a `sockaddr_storage` filled by `accept` into a socket address.
pub(crate) fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let v4: &libc::sockaddr_in =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(v4.sin_addr.s_addr);
            Some(SocketAddr::from((ip.to_be_bytes(), u16::from_be(v4.sin_port))))
        }
        libc::AF_INET6 => {
            let v6: &libc::sockaddr_in6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::from((
                v6.sin6_addr.s6_addr,
                u16::from_be(v6.sin6_port),
            )))
        }
        _ => None,
    }
}
