//! Tandem sync protocol
//!
//! Binary frames carried one per WebSocket message.
//!
//! ## Frame Format
//! ```text
//! +-----------+----------+-----------------------------+
//! | flags: u8 | kind: u8 | payload (LZ4 if flags & 1)   |
//! +-----------+----------+-----------------------------+
//! ```
//!
//! | Kind       | Tag | Payload          |
//! |------------|-----|------------------|
//! | SyncStep1  | 0   | state vector     |
//! | SyncStep2  | 1   | update           |
//! | Update     | 2   | update           |
//! | Awareness  | 3   | awareness update |
//! | Close      | 4   | empty            |

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Codec, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Message, MessageKind};
