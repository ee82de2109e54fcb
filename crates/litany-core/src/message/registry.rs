//! Pending-message registry
//!
//! Tracks outgoing text records until the peer acknowledges them and owns
//! the allocation of message ids. Delivery is at-least-once: every entry
//! older than [`RETRY_INTERVAL`] is handed back for retransmission on each
//! sweep, without backoff and without a retry cap. The only ways an entry
//! leaves the registry are a matching ack or dropping the registry.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::record::{Record, HEARTBEAT_ID};
use crate::error::LitanyResult;
use crate::types::PeerId;

/// Age after which an unacknowledged message is sent again.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Message id allocator
///
/// Seeded as `(peer << 56) | (random32 << 24) | 1`: the high byte tells
/// senders apart, the random middle bits tell restarts apart. Ids only ever
/// increase within one seeding.
///
/// An id never leaves its peer's high byte and is never [`HEARTBEAT_ID`].
/// When counting up would do either, the sequence reseeds the middle bits
/// with fresh randomness and starts over at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumber(u64);

const PEER_BITS: u64 = 0xff << 56;

impl SequenceNumber {
    /// Seed with fresh randomness
    pub fn seeded(peer: PeerId) -> Self {
        Self::from_parts(peer, rand::random::<u32>())
    }

    /// Seed with an explicit random component
    pub fn from_parts(peer: PeerId, random: u32) -> Self {
        Self::from_bits(u64::from(peer.get()) << 56, random)
    }

    fn from_bits(peer_bits: u64, random: u32) -> Self {
        Self(peer_bits | (u64::from(random) << 24) | 1)
    }

    /// The id the next registered message will get
    pub fn peek(&self) -> u64 {
        self.0
    }

    fn advance(&mut self) -> u64 {
        self.advance_with(rand::random)
    }

    fn advance_with(&mut self, random: impl FnOnce() -> u32) -> u64 {
        let id = self.0;
        let peer_bits = id & PEER_BITS;

        *self = match id.checked_add(1) {
            Some(next) if next & PEER_BITS == peer_bits && next != HEARTBEAT_ID => Self(next),
            _ => {
                debug!(last = id, "Message ids exhausted, reseeding");
                Self::from_bits(peer_bits, random())
            }
        };

        id
    }
}

/// An outgoing text message awaiting acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: u64,
    /// When the message was last (re)transmitted
    pub age: Instant,
    pub record: Record,
}

/// Registry of unacknowledged messages, kept in insertion order
#[derive(Debug)]
pub struct MessageRegistry {
    sequence: SequenceNumber,
    pending: Vec<PendingEntry>,
}

impl MessageRegistry {
    /// Create a registry whose ids carry `local` in the high byte
    pub fn new(local: PeerId) -> Self {
        Self::with_sequence(SequenceNumber::seeded(local))
    }

    /// Create a registry starting at an explicit sequence number
    pub fn with_sequence(sequence: SequenceNumber) -> Self {
        Self {
            sequence,
            pending: Vec::new(),
        }
    }

    /// Reseed the id allocator and drop everything pending
    pub fn reset(&mut self, local: PeerId) {
        self.sequence = SequenceNumber::seeded(local);
        self.pending.clear();
    }

    /// The id the next registered message will get
    pub fn next_id(&self) -> u64 {
        self.sequence.peek()
    }

    /// Register a text message for delivery.
    ///
    /// Empty or oversized messages are rejected before an id is allocated.
    pub fn register(&mut self, data: &[u8], now: Instant) -> LitanyResult<&PendingEntry> {
        let record = Record::text(self.sequence.peek(), data)?;
        let id = self.sequence.advance();

        trace!(id, len = data.len(), "Registered message");

        self.pending.push(PendingEntry {
            id,
            age: now,
            record,
        });

        let index = self.pending.len() - 1;
        Ok(&self.pending[index])
    }

    /// Remove the entry with the given id.
    ///
    /// Returns whether an entry was removed; unknown ids (duplicate or late
    /// acks) are ignored.
    pub fn ack(&mut self, id: u64) -> bool {
        match self.pending.iter().position(|entry| entry.id == id) {
            Some(index) => {
                self.pending.remove(index);
                trace!(id, "Message acknowledged");
                true
            }
            None => false,
        }
    }

    /// Collect every entry due for retransmission and refresh its age.
    pub fn sweep(&mut self, now: Instant) -> Vec<Record> {
        let mut due = Vec::new();

        for entry in self.pending.iter_mut() {
            if now.saturating_duration_since(entry.age) >= RETRY_INTERVAL {
                entry.age = now;
                due.push(entry.record.clone());
            }
        }

        due
    }

    /// Look up a pending entry
    pub fn get(&self, id: u64) -> Option<&PendingEntry> {
        self.pending.iter().find(|entry| entry.id == id)
    }

    /// Iterate pending entries in submission order
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
