//! Worker-local connection plane.
//!
//! This crate contains everything a single proxy worker needs to accept and
//! drive connections: a readiness event dispatcher with timers and deferred
//! deletion, listen sockets, plain and TLS listeners, buffered flow-controlled
//! connections with network filter chains, and the proxy-protocol pre-filter.
//!
//! Everything here is single-threaded by design. One worker owns one
//! [`event::Dispatcher`] and every connection, timer, and filter callback runs
//! serially on that worker's loop. Workers are peers that share nothing but
//! the listening sockets and the stats region.

pub mod address;
pub mod connection;
pub mod event;
pub mod filter;
pub mod listener;
pub mod proxy_proto;
pub mod socket;
pub mod tls;

mod error;

pub use connection::{CloseType, Connection, ConnectionCallbacks, ConnectionEvent, State};
pub use error::Error;
pub use filter::{FilterChainFactory, FilterStatus, ReadFilter, WriteFilter};
pub use listener::{ConnectionHandler, Listener, ListenerCallbacks, ListenerOptions};
pub use socket::ListenSocket;

/// Default per-connection read buffer watermark when the listener config
/// leaves `per_connection_buffer_limit_bytes` at zero.
pub const DEFAULT_READ_BUFFER_LIMIT: usize = 1024 * 1024;
