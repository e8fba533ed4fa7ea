//! Error types for the connection plane.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while setting up sockets, listeners, and TLS contexts.
///
/// Per-connection I/O failures are not represented here; they drive the
/// owning connection to `RemoteClose` and never escape the event loop.
#[derive(Debug, Error)]
pub enum Error {
    /// Listener address did not parse as `tcp://host:port`.
    #[error("invalid address '{0}': expected tcp://host:port")]
    InvalidAddress(String),

    /// Binding the listen socket failed.
    #[error("cannot bind '{addr}': {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    /// `listen()` on a bound socket failed.
    #[error("cannot listen on '{addr}': {source}")]
    Listen { addr: SocketAddr, source: io::Error },

    /// Miscellaneous socket-level failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// TLS context could not be constructed from the supplied material.
    #[error("tls context error: {0}")]
    TlsContext(String),
}
