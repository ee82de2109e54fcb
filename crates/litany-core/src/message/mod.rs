//! Chat messages on the wire and their delivery bookkeeping
//!
//! - [`record`]: the fixed-size record exchanged through the secure channel
//! - [`registry`]: ids, pending messages, acks and retransmission

pub mod record;
pub mod registry;

pub use record::{
    check_text_len, MessageKind, Record, RecordError, HEARTBEAT_ID, MAX_PAYLOAD, RECORD_SIZE,
    SYSTEM_ID,
};
pub use registry::{MessageRegistry, PendingEntry, SequenceNumber, RETRY_INTERVAL};
