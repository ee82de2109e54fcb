//! The secure channel seam
//!
//! Encryption, key exchange and the cathedral (rendezvous) framing are done
//! by an external secure channel. Litany only feeds it plaintext records and
//! raw datagrams, and consumes what it produces.
//!
//! Instead of re-entrant callbacks, every channel call pushes its results
//! into an [`Outbox`]. The owner drains the outbox after each call, running
//! every produced output to completion before the next event is handled.
//!
//! ```text
//!   record ──encrypt──► ┌────────────────┐ ──► Datagram { Peer, .. }
//!                       │ SecureChannel  │ ──► Datagram { Cathedral, .. }
//!   datagram ─decrypt─► │                │ ──► Plaintext(record)
//!   tick ────────────►  └────────────────┘ ──► Event(ChannelEvent)
//! ```

use std::collections::VecDeque;

use bytes::Bytes;
use thiserror::Error;

use crate::config::CathedralConfig;
use crate::types::PresenceBitmap;

/// Errors reported by the secure channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No shared secret has been established yet
    #[error("no secret yet")]
    NoSecret,

    /// No transmit key is installed yet
    #[error("no transmit key yet")]
    NoTxKey,

    /// Anything else; never recovered from
    #[error("{0}")]
    Failed(String),
}

impl ChannelError {
    /// Conditions that are expected before the first handshake completes.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::NoSecret | ChannelError::NoTxKey)
    }
}

/// Swallow the transient conditions, keep everything else.
pub fn tolerate(result: Result<(), ChannelError>) -> Result<(), ChannelError> {
    match result {
        Err(err) if err.is_transient() => Ok(()),
        other => other,
    }
}

/// Where a ciphertext datagram should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    /// The peer's best-known address
    Peer,
    /// The cathedral
    Cathedral,
    /// The cathedral's NAT detection port (cathedral port + 1)
    CathedralNat,
}

/// Notifications from the secure channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Key establishment progressed
    KeysInfo {
        tx_spi: u32,
        rx_spi: u32,
        peer_id: u64,
    },
    /// Key exchange progress, human readable
    ExchangeInfo { reason: String },
    /// The cathedral learned a new address for our peer.
    ///
    /// Both fields are in network byte order.
    PeerDiscovery { ip: [u8; 4], port: [u8; 2] },
    /// Fresh key material arrived from the cathedral
    AmbryReceived { generation: u32 },
    /// The cathedral answered a beacon
    LiturgyReceived { peers: PresenceBitmap },
}

/// Something the secure channel produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutput {
    /// Ciphertext to put on the wire
    Datagram { dest: Destination, data: Bytes },
    /// A decrypted record for us
    Plaintext(Bytes),
    /// A notification
    Event(ChannelEvent),
}

/// Queue of channel outputs, drained by the owner
#[derive(Debug, Default)]
pub struct Outbox {
    items: VecDeque<ChannelOutput>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a ciphertext datagram
    pub fn datagram(&mut self, dest: Destination, data: impl Into<Bytes>) {
        self.items.push_back(ChannelOutput::Datagram {
            dest,
            data: data.into(),
        });
    }

    /// Queue a decrypted record
    pub fn plaintext(&mut self, data: impl Into<Bytes>) {
        self.items.push_back(ChannelOutput::Plaintext(data.into()));
    }

    /// Queue a notification
    pub fn event(&mut self, event: ChannelEvent) {
        self.items.push_back(ChannelOutput::Event(event));
    }

    /// Take the oldest output
    pub fn pop(&mut self) -> Option<ChannelOutput> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// An encrypted, key-managed transport to one peer or the cathedral.
///
/// Implementations must not block and must report results only through the
/// outbox they are handed.
pub trait SecureChannel: Send + 'static {
    /// Install the cathedral parameters. Called once, before anything else.
    fn configure(&mut self, config: &CathedralConfig) -> Result<(), ChannelError>;

    /// Encrypt a plaintext record and queue it for the peer.
    fn encrypt(&mut self, record: &[u8], out: &mut Outbox) -> Result<(), ChannelError>;

    /// Feed a datagram read from the socket.
    fn decrypt(&mut self, packet: &[u8], out: &mut Outbox) -> Result<(), ChannelError>;

    /// Make progress on key establishment and rotation.
    fn key_maintenance(&mut self, out: &mut Outbox) -> Result<(), ChannelError>;

    /// Tell the cathedral we are still here.
    fn notify_presence(&mut self, out: &mut Outbox) -> Result<(), ChannelError>;

    /// Ask the cathedral to probe our NAT mapping.
    fn probe_nat(&mut self, out: &mut Outbox) -> Result<(), ChannelError>;

    /// Send a beacon to the cathedral, optionally carrying an intent bitmap.
    fn liturgy(
        &mut self,
        intent: Option<&PresenceBitmap>,
        out: &mut Outbox,
    ) -> Result<(), ChannelError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A recording channel for unit tests: "encryption" is the identity
    //! function and every call is remembered.

    use super::*;

    #[derive(Debug, Default)]
    pub struct MockChannel {
        pub configured: Option<CathedralConfig>,
        pub encrypted: Vec<Vec<u8>>,
        pub key_manage_calls: usize,
        pub notify_calls: usize,
        pub nat_calls: usize,
        pub liturgies: Vec<Option<Vec<u8>>>,
        /// Error returned by the next `key_maintenance` call
        pub key_error: Option<ChannelError>,
        /// Error returned by every `encrypt` call
        pub encrypt_error: Option<ChannelError>,
    }

    impl SecureChannel for MockChannel {
        fn configure(&mut self, config: &CathedralConfig) -> Result<(), ChannelError> {
            self.configured = Some(config.clone());
            Ok(())
        }

        fn encrypt(&mut self, record: &[u8], out: &mut Outbox) -> Result<(), ChannelError> {
            if let Some(err) = self.encrypt_error.clone() {
                return Err(err);
            }
            self.encrypted.push(record.to_vec());
            out.datagram(Destination::Peer, record.to_vec());
            Ok(())
        }

        fn decrypt(&mut self, packet: &[u8], out: &mut Outbox) -> Result<(), ChannelError> {
            out.plaintext(packet.to_vec());
            Ok(())
        }

        fn key_maintenance(&mut self, _out: &mut Outbox) -> Result<(), ChannelError> {
            self.key_manage_calls += 1;
            match self.key_error.take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn notify_presence(&mut self, out: &mut Outbox) -> Result<(), ChannelError> {
            self.notify_calls += 1;
            out.datagram(Destination::Cathedral, b"notify".to_vec());
            Ok(())
        }

        fn probe_nat(&mut self, out: &mut Outbox) -> Result<(), ChannelError> {
            self.nat_calls += 1;
            out.datagram(Destination::CathedralNat, b"nat".to_vec());
            Ok(())
        }

        fn liturgy(
            &mut self,
            intent: Option<&PresenceBitmap>,
            out: &mut Outbox,
        ) -> Result<(), ChannelError> {
            self.liturgies.push(intent.map(|map| map.as_bytes().to_vec()));
            out.datagram(Destination::Cathedral, b"liturgy".to_vec());
            Ok(())
        }
    }
}
