//! HTTP/1 upstream codec client and connection pool.
//!
//! Filters that need an upstream request pull a stream from a per-host
//! [`ConnPool`]; the pool owns the persistent upstream connections, their
//! HTTP/1 codecs, admission control, connect timeouts, pending-request
//! queueing, and drain signalling. One codec client carries at most one
//! stream at a time — HTTP/1 has no multiplexing — so concurrency comes from
//! the pool's bounded set of connections.

pub mod codec;
pub mod pool;

#[cfg(test)]
mod tests;

pub use codec::{RequestHead, ResponseDecoder, ResponseHead};
pub use pool::{
    Cancellable, ConnPool, ConnPoolConfig, PoolCallbacks, PoolFailureReason, StreamCallbacks,
    StreamEncoder, StreamResetReason,
};
