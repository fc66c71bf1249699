//! Tandem Core - sequence CRDT and presence
//!
//! This crate provides the merge engine behind Tandem:
//! - Identifier-addressed text document with tombstones and state vectors
//! - Binary update codec for operations, state vectors and awareness
//! - Awareness (presence) registry with clocks and expiry
//! - Local-only undo/redo over identifiers

pub mod awareness;
pub mod crdt;
pub mod document;
pub mod encoding;
pub mod error;
pub mod undo;

pub use awareness::{
    AwarenessChange, AwarenessEntry, AwarenessRegistry, AwarenessState, AwarenessUpdate, UserPresence,
    DEFAULT_AWARENESS_TIMEOUT,
};
pub use crdt::{OpId, Operation, ReplicaId, StateVector, Update};
pub use document::{ChangeSet, Document, DocumentStats};
pub use encoding::{Decode, Encode};
pub use error::{Error, Result};
pub use undo::{UndoManager, DEFAULT_CAPTURE_TIMEOUT};
