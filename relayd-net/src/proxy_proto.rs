//! PROXY protocol v1 pre-filter.
//!
//! When a listener has `use_proxy_proto` set, every accepted socket first
//! passes through here: one `PROXY TCP4 ...` line is consumed before any
//! user filter sees bytes, and the advertised source becomes the
//! connection's remote address. A malformed line closes the socket and
//! counts `downstream_cx_proxy_proto_error`.
//!
//! The line is peeked (`MSG_PEEK`) and then consumed exactly, so nothing
//! past the terminator is stolen from the connection proper.

use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::RawFd;

/// v1 lines are at most 107 bytes including the terminator; a little slack
/// keeps the scan simple.
pub(crate) const MAX_PROXY_PROTO_LEN: usize = 128;

const PROXY_TCP4: &[u8] = b"PROXY TCP4 ";

/// Incremental line-read state for one pending socket.
pub(crate) struct ProxyLineReader {
    buf: [u8; MAX_PROXY_PROTO_LEN],
    buf_off: usize,
    search_index: usize,
}

pub(crate) enum ProxyLineResult {
    /// Need more bytes; wait for the next readiness event.
    Again,
    /// Terminated line consumed; parse it.
    Line(Vec<u8>),
    Error,
}

impl ProxyLineReader {
    pub(crate) fn new() -> ProxyLineReader {
        ProxyLineReader {
            buf: [0; MAX_PROXY_PROTO_LEN],
            buf_off: 0,
            search_index: 1,
        }
    }

    /// Advance the read. Peeks what the kernel has, scans for `\r\n`, then
    /// consumes exactly the scanned span so the terminator is the last byte
    /// taken off the socket.
    pub(crate) fn read_line(&mut self, fd: RawFd) -> ProxyLineResult {
        while self.buf_off < MAX_PROXY_PROTO_LEN {
            let peeked = unsafe {
                libc::recv(
                    fd,
                    self.buf.as_mut_ptr().add(self.buf_off) as *mut libc::c_void,
                    MAX_PROXY_PROTO_LEN - self.buf_off,
                    libc::MSG_PEEK,
                )
            };

            if peeked == -1 {
                let errno = std::io::Error::last_os_error();
                if errno.kind() == std::io::ErrorKind::WouldBlock {
                    return ProxyLineResult::Again;
                }
                return ProxyLineResult::Error;
            }
            if peeked < 1 {
                return ProxyLineResult::Error;
            }

            let mut found = false;
            let peeked = peeked as usize;
            while self.search_index < self.buf_off + peeked {
                if self.buf[self.search_index] == b'\n' && self.buf[self.search_index - 1] == b'\r'
                {
                    self.search_index += 1;
                    found = true;
                    break;
                }
                self.search_index += 1;
            }

            let to_consume = if found {
                self.search_index - self.buf_off
            } else {
                peeked
            };
            let consumed = unsafe {
                libc::recv(
                    fd,
                    self.buf.as_mut_ptr().add(self.buf_off) as *mut libc::c_void,
                    to_consume,
                    0,
                )
            };
            if consumed < 1 {
                return ProxyLineResult::Error;
            }
            self.buf_off += consumed as usize;

            if found {
                return ProxyLineResult::Line(self.buf[..self.buf_off].to_vec());
            }
        }

        ProxyLineResult::Error
    }
}

/// Parse `PROXY TCP4 <src> <dst> <sport> <dport>\r\n` into the advertised
/// source address. Only TCP4 is recognised.
pub(crate) fn parse_proxy_line(line: &[u8]) -> Option<SocketAddr> {
    if !line.starts_with(PROXY_TCP4) || !line.ends_with(b"\r\n") {
        return None;
    }
    let body = std::str::from_utf8(&line[PROXY_TCP4.len()..line.len() - 2]).ok()?;
    let mut fields = body.split(' ');
    let src: Ipv4Addr = fields.next()?.parse().ok()?;
    let _dst = fields.next()?;
    let sport: u16 = fields.next()?.parse().ok()?;
    let _dport: u16 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some(SocketAddr::from((src, sport)))
}
