//! Connection seam between a roster channel and the network.
//!
//! The channel driver only needs text frames in and out; anything that can
//! provide that (a real WebSocket, an in-memory pipe in tests) plugs in here.

use std::future::Future;

use crate::error::TransportError;

pub mod memory;
pub mod ws;

/// Opens connections to a roster endpoint.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One open connection carrying JSON text frames.
pub trait Connection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame. `None` once the peer has closed the connection.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    /// Close gracefully and release the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}
