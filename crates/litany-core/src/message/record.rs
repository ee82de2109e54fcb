//! Fixed-size wire record
//!
//! Every message exchanged through the secure channel is exactly
//! [`RECORD_SIZE`] bytes, all integers big-endian:
//!
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────────────────────────┐
//! │ id (u64) │ len (u16)  │ type (u8)│ payload (512 bytes, 0-padded)│
//! └──────────┴────────────┴──────────┴──────────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::{LitanyError, LitanyResult};

/// Maximum number of payload bytes per record.
pub const MAX_PAYLOAD: usize = 512;

/// Size of an encoded record on the wire.
pub const RECORD_SIZE: usize = 8 + 2 + 1 + MAX_PAYLOAD;

/// Reserved id for locally synthesized system messages.
///
/// Never sent, never accepted from the wire.
pub const SYSTEM_ID: u64 = 0;

/// Id carried by heartbeat records.
pub const HEARTBEAT_ID: u64 = u64::MAX;

/// Kind of a wire record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Chat text, acknowledged and retried until acked
    Text = 1,
    /// Acknowledges the text record with the same id
    Ack = 2,
    /// Keeps NAT mappings open and the peer marked alive
    Heartbeat = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::Ack),
            3 => Ok(MessageKind::Heartbeat),
            other => Err(RecordError::UnknownKind(other)),
        }
    }
}

/// Reasons an inbound record gets dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed record ({0} bytes, expected {})", RECORD_SIZE)]
    WrongSize(usize),

    #[error("peer tried sending a system message")]
    SystemId,

    #[error("bad payload length ({0})")]
    Oversized(usize),

    /// Size, id and length were fine; only the type is unknown
    #[error("unknown record type {0}")]
    UnknownKind(u8),
}

/// A decoded wire record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u64,
    pub kind: MessageKind,
    payload: Vec<u8>,
}

impl Record {
    /// Build a text record, enforcing `0 < len < MAX_PAYLOAD`.
    pub fn text(id: u64, data: &[u8]) -> LitanyResult<Self> {
        check_text_len(data.len())?;
        Ok(Self {
            id,
            kind: MessageKind::Text,
            payload: data.to_vec(),
        })
    }

    /// Build an ack for the text record `id`.
    pub fn ack(id: u64) -> Self {
        Self {
            id,
            kind: MessageKind::Ack,
            payload: Vec::new(),
        }
    }

    /// Build a heartbeat record.
    pub fn heartbeat() -> Self {
        Self {
            id: HEARTBEAT_ID,
            kind: MessageKind::Heartbeat,
            payload: Vec::new(),
        }
    }

    /// The payload bytes (without padding)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as display text
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode into exactly [`RECORD_SIZE`] bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RECORD_SIZE);
        buf.put_u64(self.id);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        buf.put_bytes(0, MAX_PAYLOAD - self.payload.len());
        buf.freeze()
    }

    /// Decode and validate a record received from the peer.
    ///
    /// The type is checked last.
    pub fn decode(mut data: &[u8]) -> Result<Self, RecordError> {
        if data.len() != RECORD_SIZE {
            return Err(RecordError::WrongSize(data.len()));
        }

        let id = data.get_u64();
        let len = data.get_u16() as usize;
        let kind = data.get_u8();

        if id == SYSTEM_ID {
            return Err(RecordError::SystemId);
        }

        if len > MAX_PAYLOAD {
            return Err(RecordError::Oversized(len));
        }

        let kind = MessageKind::try_from(kind)?;

        Ok(Self {
            id,
            kind,
            payload: data[..len].to_vec(),
        })
    }
}

/// Reject text that is empty or does not fit in a record.
pub fn check_text_len(len: usize) -> LitanyResult<()> {
    if len == 0 {
        return Err(LitanyError::EmptyMessage);
    }
    if len >= MAX_PAYLOAD {
        return Err(LitanyError::MessageTooLarge(len));
    }
    Ok(())
}
