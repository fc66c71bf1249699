//! Frame codec
//!
//! Encodes messages into self-contained frames and decodes them back.
//! Payloads at or above the compression threshold are LZ4-compressed.
//! Compression is negotiated per connection: `transcode` rewrites a frame
//! into the form one peer asked for.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Message, MessageKind};
use bytes::{BufMut, Bytes, BytesMut};
use tandem_core::{AwarenessUpdate, Decode, Encode, StateVector, Update};
use tracing::trace;

/// Payload size from which frames are compressed
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Largest frame accepted, compressed or not (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0x01;
const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct Codec {
    compression_threshold: usize,
    max_frame_size: usize,
}

impl Codec {
    pub fn new(compression_threshold: usize, max_frame_size: usize) -> Self {
        Self {
            compression_threshold,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Same limits, never compressing
    pub fn uncompressed(&self) -> Codec {
        Codec::new(0, self.max_frame_size)
    }

    /// Encode a message into one frame
    pub fn encode(&self, message: &Message) -> Bytes {
        let mut payload = Vec::new();
        match message {
            Message::SyncStep1(sv) => sv.encode(&mut payload),
            Message::SyncStep2(update) | Message::Update(update) => update.encode(&mut payload),
            Message::Awareness(update) => update.encode(&mut payload),
            Message::Close => {}
        }
        self.frame(message.kind(), &payload)
    }

    /// Wrap an already encoded payload
    pub fn frame(&self, kind: MessageKind, payload: &[u8]) -> Bytes {
        self.build(kind, payload, self.should_compress(payload.len()))
    }

    /// Rewrite `frame` for a peer that does (`compress`) or does not accept
    /// compressed frames. The message itself is unchanged.
    pub fn transcode(&self, frame: &Bytes, compress: bool) -> ProtocolResult<Bytes> {
        let kind = Self::peek_kind(frame)?;
        let flags = frame[0];
        let body = &frame[HEADER_LEN..];
        if flags & FLAG_COMPRESSED != 0 {
            if compress {
                return Ok(frame.clone());
            }
            let payload = self.decompress(body)?;
            return Ok(self.build(kind, &payload, false));
        }
        if compress && self.should_compress(body.len()) {
            return Ok(self.build(kind, body, true));
        }
        Ok(frame.clone())
    }

    fn should_compress(&self, len: usize) -> bool {
        self.compression_threshold > 0 && len >= self.compression_threshold
    }

    fn build(&self, kind: MessageKind, payload: &[u8], compress: bool) -> Bytes {
        let body = if compress {
            lz4_flex::compress_prepend_size(payload)
        } else {
            payload.to_vec()
        };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u8(if compress { FLAG_COMPRESSED } else { 0 });
        buf.put_u8(kind as u8);
        buf.put_slice(&body);
        trace!(kind = %kind, payload = payload.len(), frame = buf.len(), compressed = compress, "Encoded frame");
        buf.freeze()
    }

    /// Read the kind of a frame without decoding its payload
    pub fn peek_kind(frame: &[u8]) -> ProtocolResult<MessageKind> {
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated("missing frame header"));
        }
        MessageKind::try_from(frame[1])
    }

    /// Decode one frame
    pub fn decode(&self, frame: &[u8]) -> ProtocolResult<Message> {
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        if frame.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated("missing frame header"));
        }

        let flags = frame[0];
        if flags & !FLAG_COMPRESSED != 0 {
            return Err(ProtocolError::UnknownFlags(flags));
        }
        let kind = MessageKind::try_from(frame[1])?;
        let body = &frame[HEADER_LEN..];

        let decompressed;
        let payload = if flags & FLAG_COMPRESSED != 0 {
            decompressed = self.decompress(body)?;
            decompressed.as_slice()
        } else {
            body
        };

        let message = match kind {
            MessageKind::SyncStep1 => Message::SyncStep1(StateVector::decode_from_slice(payload)?),
            MessageKind::SyncStep2 => Message::SyncStep2(Update::decode_from_slice(payload)?),
            MessageKind::Update => Message::Update(Update::decode_from_slice(payload)?),
            MessageKind::Awareness => Message::Awareness(AwarenessUpdate::decode_from_slice(payload)?),
            MessageKind::Close => {
                if !payload.is_empty() {
                    return Err(tandem_core::Error::Decode("close frame carries a payload".into()).into());
                }
                Message::Close
            }
        };
        Ok(message)
    }

    fn decompress(&self, body: &[u8]) -> ProtocolResult<Vec<u8>> {
        let prefix: [u8; 4] = body
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(ProtocolError::Truncated("missing decompressed size"))?;
        // refuse to allocate for sizes we would reject anyway
        let size = u32::from_le_bytes(prefix) as usize;
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        lz4_flex::decompress_size_prepended(body).map_err(|e| ProtocolError::Decompression(e.to_string()))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE)
    }
}
