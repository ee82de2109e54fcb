//! The roster: who is online and who wants to chat

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{BeaconHandle, EVENT_CHANNEL_CAPACITY};
use crate::beacon::{BeaconUpdate, Liturgy, PresenceBeacon, SignalBeacon};
use crate::channel::SecureChannel;
use crate::config::Settings;
use crate::error::LitanyResult;
use crate::liveness::{PeerLabel, PeerState, Roster, RosterChange};
use crate::types::PeerId;

/// Runs the discovery and signaling beacons and keeps the [`Roster`]
pub struct Lobby {
    local: PeerId,
    roster: Arc<Mutex<Roster>>,
    changes: broadcast::Sender<RosterChange>,
    discovery: BeaconHandle<PresenceBeacon>,
    signaling: BeaconHandle<SignalBeacon>,
    task: JoinHandle<()>,
}

impl Lobby {
    /// Start both beacons, each over its own secure channel.
    pub async fn spawn<C: SecureChannel>(
        settings: &Settings,
        discovery_channel: C,
        signaling_channel: C,
    ) -> LitanyResult<Self> {
        let discovery = Liturgy::new(settings, PresenceBeacon::new(), None, discovery_channel)?;
        let signaling = Liturgy::new(settings, SignalBeacon::new(), None, signaling_channel)?;

        let (updates, update_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let roster = Arc::new(Mutex::new(Roster::new()));

        let discovery = BeaconHandle::spawn(discovery, updates.clone()).await?;
        let signaling = BeaconHandle::spawn(signaling, updates).await?;

        info!(local = %settings.kek_id, "Lobby started");

        let task = tokio::spawn(Self::apply_updates(
            update_rx,
            roster.clone(),
            changes.clone(),
        ));

        Ok(Self {
            local: settings.kek_id,
            roster,
            changes,
            discovery,
            signaling,
            task,
        })
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Whether both beacons are still running
    pub fn is_running(&self) -> bool {
        self.discovery.is_running() && self.signaling.is_running()
    }

    /// Subscribe to roster changes
    pub fn subscribe(&self) -> broadcast::Receiver<RosterChange> {
        self.changes.subscribe()
    }

    pub fn state(&self, peer: PeerId) -> PeerState {
        self.roster.lock().get(peer)
    }

    pub fn label(&self, peer: PeerId) -> PeerLabel {
        self.roster.lock().label(peer)
    }

    /// Online peers in id order
    pub fn online(&self) -> Vec<PeerId> {
        self.roster.lock().online().collect()
    }

    /// A chat window for `peer` was opened: show it as open and ask the peer
    /// to open theirs.
    pub async fn open_chat(&self, peer: PeerId) -> LitanyResult<()> {
        let change = self.roster.lock().open_chat(peer);
        self.publish(change);
        self.signaling.set_intent(peer, true).await
    }

    /// The chat window for `peer` was closed.
    pub async fn close_chat(&self, peer: PeerId) -> LitanyResult<()> {
        let change = self.roster.lock().close_chat(peer);
        self.publish(change);
        self.signaling.set_intent(peer, false).await
    }

    fn publish(&self, change: Option<RosterChange>) {
        if let Some(change) = change {
            let _ = self.changes.send(change);
        }
    }

    async fn apply_updates(
        mut updates: mpsc::UnboundedReceiver<BeaconUpdate>,
        roster: Arc<Mutex<Roster>>,
        changes: broadcast::Sender<RosterChange>,
    ) {
        while let Some(update) = updates.recv().await {
            let change = roster.lock().apply(update);
            if let Some(change) = change {
                debug!(?change, "Roster changed");
                let _ = changes.send(change);
            }
        }

        debug!("Roster task ended");
    }
}

impl Drop for Lobby {
    fn drop(&mut self) {
        self.task.abort();
    }
}
