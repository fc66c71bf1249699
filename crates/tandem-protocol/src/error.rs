//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding a frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),

    #[error("Truncated frame: {0}")]
    Truncated(&'static str),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Core error: {0}")]
    Core(#[from] tandem_core::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
