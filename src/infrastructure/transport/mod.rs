//! Transport Seam
//!
//! The session drives a [`Connection`] obtained from a [`Connector`]. Frames
//! cross this boundary as text; encoding stays in the gateway codec.

mod websocket;

pub use websocket::WebSocketConnector;

use async_trait::async_trait;

use crate::domain::Credential;
use crate::shared::error::Result;

/// Opens authenticated connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection. Rejected credentials surface as
    /// `RealtimeError::Auth`, anything else network related as `Transport`.
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn Connection>>;
}

/// One open, bidirectional text-frame connection.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Next inbound text frame.
    ///
    /// Returns `None` once the remote end closed the connection. Must be
    /// cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}
