//! Group chat: one tunnel per online group member

use std::collections::BTreeMap;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::{BeaconHandle, TunnelHandle, COMMAND_CHANNEL_CAPACITY, EVENT_CHANNEL_CAPACITY};
use crate::beacon::{BeaconUpdate, Liturgy, PresenceBeacon};
use crate::channel::SecureChannel;
use crate::config::Settings;
use crate::error::{LitanyError, LitanyResult};
use crate::message::check_text_len;
use crate::tunnel::{Tunnel, TunnelEvent};
use crate::types::{GroupId, PeerId};

enum Command {
    SendText {
        text: Vec<u8>,
        reply: oneshot::Sender<Vec<(PeerId, u64)>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

/// A group chat
///
/// A discovery beacon scoped to the group reports who is around. A tunnel
/// is opened to every member that comes online and torn down when it goes
/// offline, dropping whatever was still pending for it. All tunnels publish
/// on one event stream.
///
/// A member tunnel that fails with a fatal channel error ends the group:
/// [`is_running`](Self::is_running) turns false and [`join`](Self::join)
/// returns the member's error.
pub struct GroupChat {
    group: GroupId,
    local: PeerId,
    discovery: BeaconHandle<PresenceBeacon>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TunnelEvent>,
    task: Option<JoinHandle<LitanyResult<()>>>,
}

impl GroupChat {
    /// Join `group`.
    ///
    /// `make_channel` is called for the beacon and for every tunnel.
    pub async fn spawn<C, F>(settings: Settings, group: GroupId, mut make_channel: F) -> LitanyResult<Self>
    where
        C: SecureChannel + Sync,
        F: FnMut() -> C + Send + 'static,
    {
        // Tunnels are created later; refuse a configuration they cannot use
        settings.tunnel_config(settings.kek_id, Some(group))?;

        let liturgy = Liturgy::new(&settings, PresenceBeacon::new(), Some(group), make_channel())?;

        let (updates, update_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let discovery = BeaconHandle::spawn(liturgy, updates).await?;

        info!(%group, local = %settings.kek_id, "Joined group");

        let local = settings.kek_id;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let task = tokio::spawn(run(
            settings,
            group,
            make_channel,
            update_rx,
            command_rx,
            events.clone(),
        ));

        Ok(Self {
            group,
            local,
            discovery,
            commands,
            events,
            task: Some(task),
        })
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Whether the beacon and the group task are still running
    pub fn is_running(&self) -> bool {
        self.discovery.is_running() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Subscribe to events from every member's tunnel
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Send text to every member we have a tunnel to.
    ///
    /// Returns the peers it was handed to with the id it got on each tunnel.
    pub async fn send_text(&self, text: impl Into<Vec<u8>>) -> LitanyResult<Vec<(PeerId, u64)>> {
        let text = text.into();
        check_text_len(text.len())?;

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendText { text, reply })
            .await
            .map_err(|_| LitanyError::TunnelClosed)?;
        rx.await.map_err(|_| LitanyError::TunnelClosed)
    }

    /// Members we currently have a tunnel to
    pub async fn peers(&self) -> LitanyResult<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .await
            .map_err(|_| LitanyError::TunnelClosed)?;
        rx.await.map_err(|_| LitanyError::TunnelClosed)
    }

    /// Wait for the group task to end and return how it ended.
    pub async fn join(mut self) -> LitanyResult<()> {
        match self.task.take() {
            Some(task) => task.await.map_err(|_| LitanyError::TunnelClosed)?,
            None => Ok(()),
        }
    }
}

impl Drop for GroupChat {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<C, F>(
    settings: Settings,
    group: GroupId,
    mut make_channel: F,
    mut updates: mpsc::UnboundedReceiver<BeaconUpdate>,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<TunnelEvent>,
) -> LitanyResult<()>
where
    C: SecureChannel + Sync,
    F: FnMut() -> C + Send + 'static,
{
    let mut tunnels: BTreeMap<PeerId, TunnelHandle> = BTreeMap::new();
    let mut members: JoinSet<(PeerId, LitanyResult<()>)> = JoinSet::new();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(BeaconUpdate::Presence { peer, online: true })
                    if peer != settings.kek_id && !tunnels.contains_key(&peer) =>
                {
                    let tunnel = Tunnel::new(&settings, peer, Some(group), make_channel())
                        .inspect_err(|err| error!(%peer, error = %err, "Failed to create tunnel"))?;

                    match TunnelHandle::spawn_in(tunnel, events.clone(), &mut members).await {
                        Ok(handle) => {
                            info!(%group, %peer, "Member online, tunnel opened");
                            tunnels.insert(peer, handle);
                        }
                        Err(err) => warn!(%peer, error = %err, "Failed to start tunnel"),
                    }
                }
                Some(BeaconUpdate::Presence { peer, online: false }) => {
                    if let Some(handle) = tunnels.remove(&peer) {
                        info!(%group, %peer, "Member offline, tunnel closed");
                        handle.close();
                    }
                }
                Some(other) => debug!(update = ?other, "Ignoring beacon update"),
                None => {
                    debug!(%group, "Group beacon ended");
                    return Ok(());
                }
            },
            Some(joined) = members.join_next() => match joined {
                Ok((peer, Err(err))) => {
                    error!(%group, %peer, error = %err, "Member tunnel failed");
                    return Err(err);
                }
                Ok((peer, Ok(()))) => {
                    // A replacement tunnel may already be in the map
                    if tunnels.get(&peer).is_some_and(|handle| !handle.is_running()) {
                        debug!(%group, %peer, "Member tunnel ended");
                        tunnels.remove(&peer);
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    error!(%group, error = %err, "Member tunnel panicked");
                    return Err(LitanyError::TunnelClosed);
                }
            },
            command = commands.recv() => match command {
                Some(Command::SendText { text, reply }) => {
                    let mut sent = Vec::with_capacity(tunnels.len());

                    for (peer, handle) in tunnels.iter() {
                        match handle.send_text(text.clone()).await {
                            Ok(id) => sent.push((*peer, id)),
                            Err(err) => warn!(%peer, error = %err, "Member did not take text"),
                        }
                    }

                    let _ = reply.send(sent);
                }
                Some(Command::Peers { reply }) => {
                    let _ = reply.send(tunnels.keys().copied().collect());
                }
                None => return Ok(()),
            },
        }
    }
}
