//! Protocol messages

use crate::error::ProtocolError;
use std::fmt;
use tandem_core::{AwarenessUpdate, StateVector, Update};

/// Frame kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    SyncStep1 = 0,
    SyncStep2 = 1,
    Update = 2,
    Awareness = 3,
    Close = 4,
}

impl MessageKind {
    pub const ALL: [MessageKind; 5] = [
        MessageKind::SyncStep1,
        MessageKind::SyncStep2,
        MessageKind::Update,
        MessageKind::Awareness,
        MessageKind::Close,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::SyncStep1 => "sync_step1",
            MessageKind::SyncStep2 => "sync_step2",
            MessageKind::Update => "update",
            MessageKind::Awareness => "awareness",
            MessageKind::Close => "close",
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(MessageKind::SyncStep1),
            1 => Ok(MessageKind::SyncStep2),
            2 => Ok(MessageKind::Update),
            3 => Ok(MessageKind::Awareness),
            4 => Ok(MessageKind::Close),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// "Here is what I have": the sender's state vector
    SyncStep1(StateVector),
    /// Reply to SyncStep1 with everything the peer is missing
    SyncStep2(Update),
    /// Incremental update
    Update(Update),
    /// Presence delta
    Awareness(AwarenessUpdate),
    /// Graceful close
    Close,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::SyncStep1(_) => MessageKind::SyncStep1,
            Message::SyncStep2(_) => MessageKind::SyncStep2,
            Message::Update(_) => MessageKind::Update,
            Message::Awareness(_) => MessageKind::Awareness,
            Message::Close => MessageKind::Close,
        }
    }
}
