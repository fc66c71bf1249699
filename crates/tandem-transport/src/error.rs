//! Transport error types

use tandem_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid room name: {0}")]
    InvalidRoomName(String),

    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Rejected update: {0}")]
    Rejected(#[from] tandem_core::Error),

    #[error("Session no longer owns its user identity")]
    Evicted,

    #[cfg(feature = "websocket")]
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
