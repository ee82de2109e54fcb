//! Peer liveness state machine
//!
//! The roster tracks, per peer, whether it is online, whether it asked to
//! chat with us and whether we have a chat open with it. Online and pending
//! change only through beacon updates; the chat-open flag changes only
//! through local actions. Re-applying the current state is always legal and
//! never produces a change.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::beacon::BeaconUpdate;
use crate::types::PeerId;

/// State of one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub online: bool,
    /// The peer wants to chat with us
    pub pending: bool,
    /// We have a chat open with the peer
    pub chat_open: bool,
}

/// How a peer is shown in the roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerDisplay {
    Idle,
    ChatPending,
    ChatOpen,
}

impl PeerState {
    /// An open chat hides the pending marker.
    pub fn display(&self) -> PeerDisplay {
        if self.chat_open {
            PeerDisplay::ChatOpen
        } else if self.pending {
            PeerDisplay::ChatPending
        } else {
            PeerDisplay::Idle
        }
    }
}

/// A roster entry label, e.g. `Peer 05 (chat pending)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLabel {
    pub peer: PeerId,
    pub display: PeerDisplay,
}

impl fmt::Display for PeerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer {}", self.peer)?;
        match self.display {
            PeerDisplay::Idle => Ok(()),
            PeerDisplay::ChatPending => write!(f, " (chat pending)"),
            PeerDisplay::ChatOpen => write!(f, " (chat open)"),
        }
    }
}

/// A state change the UI should reflect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    /// The peer moved between the online and offline lists
    Presence { peer: PeerId, online: bool },
    /// The peer's label changed
    Display { peer: PeerId, display: PeerDisplay },
}

/// Liveness state for every known peer
#[derive(Debug, Default)]
pub struct Roster {
    peers: BTreeMap<PeerId, PeerState>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a peer; unknown peers are offline and idle
    pub fn get(&self, peer: PeerId) -> PeerState {
        self.peers.get(&peer).copied().unwrap_or_default()
    }

    pub fn label(&self, peer: PeerId) -> PeerLabel {
        PeerLabel {
            peer,
            display: self.get(peer).display(),
        }
    }

    /// Online peers in id order
    pub fn online(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers
            .iter()
            .filter(|(_, state)| state.online)
            .map(|(peer, _)| *peer)
    }

    /// Every peer in the flock that is not online, in id order
    pub fn offline(&self) -> impl Iterator<Item = PeerId> + '_ {
        PeerId::all().filter(move |peer| !self.get(*peer).online)
    }

    pub fn set_online(&mut self, peer: PeerId, online: bool) -> Option<RosterChange> {
        let state = self.peers.entry(peer).or_default();
        if state.online == online {
            return None;
        }
        state.online = online;
        Some(RosterChange::Presence { peer, online })
    }

    pub fn set_pending(&mut self, peer: PeerId, pending: bool) -> Option<RosterChange> {
        self.update(peer, |state| state.pending = pending)
    }

    /// Record that a chat window for `peer` was opened.
    pub fn open_chat(&mut self, peer: PeerId) -> Option<RosterChange> {
        self.update(peer, |state| state.chat_open = true)
    }

    /// Record that the chat window for `peer` was closed.
    pub fn close_chat(&mut self, peer: PeerId) -> Option<RosterChange> {
        self.update(peer, |state| state.chat_open = false)
    }

    /// Apply a beacon update.
    pub fn apply(&mut self, update: BeaconUpdate) -> Option<RosterChange> {
        match update {
            BeaconUpdate::Presence { peer, online } => self.set_online(peer, online),
            BeaconUpdate::ChatRequest { peer, pending } => self.set_pending(peer, pending),
        }
    }

    /// Change a peer's state, reporting a change only if its label moved.
    fn update(&mut self, peer: PeerId, f: impl FnOnce(&mut PeerState)) -> Option<RosterChange> {
        let state = self.peers.entry(peer).or_default();
        let before = state.display();
        f(state);
        let display = state.display();

        (display != before).then_some(RosterChange::Display { peer, display })
    }
}
