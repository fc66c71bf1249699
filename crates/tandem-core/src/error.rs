//! Error types for Tandem Core

use crate::crdt::OpId;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Position out of range: {pos} > {len}")]
    PositionOutOfRange { pos: usize, len: usize },

    #[error("Conflicting operation for id {0}")]
    ConflictingOperation(OpId),

    #[error("Missing dependency {missing} for operation {op}")]
    MissingDependency { op: OpId, missing: OpId },

    #[error("Invalid reference from {op} to {target}")]
    InvalidReference { op: OpId, target: OpId },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Tandem Core operations
pub type Result<T> = std::result::Result<T, Error>;
