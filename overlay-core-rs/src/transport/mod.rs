//! Transport boundary
//!
//! The engine only needs to push an encoded frame onto a connection.
//! Inbound frames are handed to [`Node::on_frame_received`] by whatever
//! owns the connection, and a closed connection is reported through
//! [`Node::connection_lost`].
//!
//! [`Node::on_frame_received`]: crate::node::Node::on_frame_received
//! [`Node::connection_lost`]: crate::node::Node::connection_lost

pub mod channel;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{ConnectionId, RawFrame};

pub use channel::{connect_raw, link, ChannelTransport, Link, RawPeer};
pub use ws::WsTransport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} closed")]
    Closed(ConnectionId),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one frame to the connection; `Ok` means the transport accepted it
    async fn send(&self, connection: ConnectionId, frame: RawFrame) -> Result<(), TransportError>;
}
