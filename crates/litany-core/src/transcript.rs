//! Chat transcript with duplicate suppression
//!
//! Retransmitted messages arrive more than once when an ack gets lost, so
//! the chat view drops any peer message whose id it already shows. System
//! lines carry [`SYSTEM_ID`] and are always appended.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::message::SYSTEM_ID;
use crate::tunnel::TunnelEvent;

/// Where a transcript line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageCategory {
    /// Text from a peer
    Received,
    /// Our own text, echoed locally
    Local,
    /// Status lines from the tunnel
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub id: u64,
    pub text: String,
    pub category: MessageCategory,
}

#[derive(Debug, Default)]
pub struct Transcript {
    lines: Vec<TranscriptLine>,
    seen: HashSet<u64>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line unless it repeats a message already shown.
    ///
    /// Returns whether the line was added.
    pub fn show(&mut self, text: impl Into<String>, id: u64, category: MessageCategory) -> bool {
        if id != SYSTEM_ID && !self.seen.insert(id) {
            return false;
        }

        self.lines.push(TranscriptLine {
            id,
            text: text.into(),
            category,
        });
        true
    }

    /// Show our own message as `<kek-id> text`.
    pub fn show_local(&mut self, local: impl std::fmt::Display, text: &str) -> bool {
        self.show(format!("<{}> {}", local, text), SYSTEM_ID, MessageCategory::Local)
    }

    /// Show whatever a tunnel event has for the user.
    pub fn apply(&mut self, event: &TunnelEvent) -> bool {
        match event {
            TunnelEvent::Message { id, text, .. } => {
                self.show(format!("<< {}", text), *id, MessageCategory::Received)
            }
            TunnelEvent::System { text, .. } => {
                self.show(text.clone(), SYSTEM_ID, MessageCategory::System)
            }
            TunnelEvent::PeerOnline { .. } | TunnelEvent::PeerOffline { .. } => false,
        }
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
