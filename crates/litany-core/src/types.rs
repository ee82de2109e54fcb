//! Core types for Litany

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LitanyError;

/// Number of slots in a flock-wide peer table, indexed by peer id.
///
/// Slot 0 is never a valid peer, so tables track peers 1 to 254. This is
/// also the size of a presence bitmap on the wire.
pub const PEERS_PER_FLOCK: usize = 255;

/// Parse a hexadecimal string with an optional `0x` prefix.
pub(crate) fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    if digits.is_empty() {
        return None;
    }

    u64::from_str_radix(digits, 16).ok()
}

/// Identity of a peer inside a flock
///
/// Peer ids range from 1 to 255; id 0 is reserved and can never be
/// constructed. Only ids below [`PEERS_PER_FLOCK`] fit a flock table: 255
/// is accepted as a local identity but the cathedral never reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PeerId(u8);

impl PeerId {
    /// Create a PeerId, rejecting the reserved id 0
    pub fn new(id: u8) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Get the raw id
    pub fn get(self) -> u8 {
        self.0
    }

    /// Get the slot index in a flock-wide table
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterate every peer id a flock table tracks (1 to 254)
    pub fn all() -> impl Iterator<Item = PeerId> {
        (1..PEERS_PER_FLOCK as u8).map(PeerId)
    }
}

impl TryFrom<u8> for PeerId {
    type Error = LitanyError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        PeerId::new(id).ok_or_else(|| LitanyError::InvalidPeerId(id.to_string()))
    }
}

impl From<PeerId> for u8 {
    fn from(peer: PeerId) -> u8 {
        peer.0
    }
}

impl FromStr for PeerId {
    type Err = LitanyError;

    /// Parse `07`, `0x07` or `7`; chat windows get launched with `chat 0x07`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex(s)
            .and_then(|v| u8::try_from(v).ok())
            .and_then(PeerId::new)
            .ok_or_else(|| LitanyError::InvalidPeerId(s.to_string()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Identifier of a group chat inside a flock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u16);

impl GroupId {
    /// Get the raw id
    pub fn get(self) -> u16 {
        self.0
    }
}

impl FromStr for GroupId {
    type Err = LitanyError;

    /// Parse 1 to 4 hex digits, with an optional `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(LitanyError::InvalidGroupId(s.to_string()));
        }

        u16::from_str_radix(digits, 16)
            .map(GroupId)
            .map_err(|_| LitanyError::InvalidGroupId(s.to_string()))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// One byte per possible peer id, each 0 or 1
///
/// Used both for "who is online" (discovery) and "who wants to chat"
/// (signaling). The two are always separate instances.
#[derive(Clone, PartialEq, Eq)]
pub struct PresenceBitmap([u8; PEERS_PER_FLOCK]);

impl PresenceBitmap {
    /// Create an empty bitmap (nobody present)
    pub fn new() -> Self {
        Self([0u8; PEERS_PER_FLOCK])
    }

    /// Build a bitmap from a rendezvous reply.
    ///
    /// Shorter input is zero-extended, longer input is truncated. Any
    /// non-zero byte counts as present.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut map = Self::new();
        for (slot, byte) in map.0.iter_mut().zip(bytes) {
            *slot = u8::from(*byte != 0);
        }
        map
    }

    /// Whether the peer is marked present
    pub fn get(&self, peer: PeerId) -> bool {
        self.0.get(peer.index()).is_some_and(|slot| *slot != 0)
    }

    /// Mark or clear a peer
    ///
    /// Peers outside the table are ignored.
    pub fn set(&mut self, peer: PeerId, present: bool) {
        if let Some(slot) = self.0.get_mut(peer.index()) {
            *slot = u8::from(present);
        }
    }

    /// Raw bytes, as sent to the rendezvous server
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Iterate the peers currently marked present
    pub fn present(&self) -> impl Iterator<Item = PeerId> + '_ {
        PeerId::all().filter(move |peer| self.get(*peer))
    }

    /// Number of peers marked present
    pub fn count(&self) -> usize {
        self.present().count()
    }
}

impl Default for PresenceBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PresenceBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.present()).finish()
    }
}
