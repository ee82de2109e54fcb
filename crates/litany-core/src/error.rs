//! Error types for Litany

use thiserror::Error;

use crate::channel::ChannelError;
use crate::message::RecordError;

/// Main error type for Litany operations
#[derive(Error, Debug)]
pub enum LitanyError {
    /// Missing or malformed configuration field
    #[error("Configuration error: {0}")]
    Config(String),

    /// The secure channel failed with a non-transient error
    #[error("Secure channel error: {0}")]
    SecureChannel(#[from] ChannelError),

    /// Text messages must carry at least one byte
    #[error("Message is empty")]
    EmptyMessage,

    /// Text message does not fit in a wire record
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Peer id could not be parsed or is the reserved id 0
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Group id could not be parsed
    #[error("Invalid group id: {0}")]
    InvalidGroupId(String),

    /// Wire record could not be decoded
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The tunnel task is no longer running
    #[error("Tunnel closed")]
    TunnelClosed,

    /// The beacon task is no longer running
    #[error("Beacon closed")]
    BeaconClosed,
}

impl LitanyError {
    /// Whether this error must bring down the owning session.
    ///
    /// Only configuration errors and non-transient secure channel errors
    /// cross the module boundary; everything else is absorbed locally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LitanyError::Config(_) | LitanyError::SecureChannel(_))
    }
}

/// Result type alias using LitanyError
pub type LitanyResult<T> = Result<T, LitanyError>;
