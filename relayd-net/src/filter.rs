//! Network filter traits.
//!
//! Filters sit on a connection and see its bytes in arrival order. A read
//! filter consumes from the connection's read buffer; whatever it leaves in
//! place is offered to the next filter in the chain. Returning
//! [`FilterStatus::StopIteration`] ends the pass.

use std::net::SocketAddr;

use bytes::BytesMut;

use crate::connection::{CloseType, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// The slice of connection behaviour filters may drive from inside a
/// callback. Implemented by the connection itself; using a narrow trait here
/// keeps filter callbacks re-entrancy safe.
pub trait ConnectionOps {
    /// Queue bytes for the peer; write filters run, then the data joins the
    /// write buffer.
    fn write(&mut self, data: &[u8]);
    fn close(&mut self, close_type: CloseType);
    fn read_disable(&mut self, disable: bool);
    fn local_address(&self) -> SocketAddr;
    fn remote_address(&self) -> SocketAddr;
    fn id(&self) -> u64;
}

pub trait ReadFilter {
    /// Called once when the connection is admitted, before any data.
    fn on_new_connection(&mut self, _conn: &mut dyn ConnectionOps) -> FilterStatus {
        FilterStatus::Continue
    }

    /// Called with the connection's read buffer. Consume by draining `data`.
    fn on_data(&mut self, data: &mut BytesMut, conn: &mut dyn ConnectionOps) -> FilterStatus;
}

pub trait WriteFilter {
    /// Called with outbound data before it reaches the write buffer.
    fn on_write(&mut self, data: &mut BytesMut) -> FilterStatus;
}

/// Builds the filter chain for a freshly accepted connection.
///
/// Returning `false` signals an empty chain; the handler closes such
/// connections immediately rather than leaving them idle forever.
pub trait FilterChainFactory {
    fn create_filter_chain(&self, connection: &Connection) -> bool;
}
