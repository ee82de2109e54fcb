//! Presence and intent beacons ("liturgies")
//!
//! A beacon periodically announces local state to the cathedral and turns
//! the bitmaps it sends back into per-peer updates. There are two kinds:
//!
//! - [`PresenceBeacon`] (discovery): sends no payload, the reply says who in
//!   the flock (or group) is online.
//! - [`SignalBeacon`] (signaling): sends "whom I want to chat with", the reply
//!   says who wants to chat with us.
//!
//! Both report only changes relative to the previous reply. Nobody is online
//! or pending before the first reply.
//!
//! [`Liturgy`] drives a beacon over the secure channel without doing I/O
//! itself, the same way [`crate::tunnel::Tunnel`] does.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::channel::{tolerate, ChannelEvent, ChannelOutput, Outbox, SecureChannel};
use crate::config::Settings;
use crate::error::LitanyResult;
use crate::tunnel::Transmit;
use crate::types::{GroupId, PeerId, PresenceBitmap};

/// Interval between beacons. The first one goes out immediately.
pub const LITURGY_INTERVAL: Duration = Duration::from_millis(2500);

/// A change reported by a beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconUpdate {
    /// A peer came online or went offline
    Presence { peer: PeerId, online: bool },
    /// A peer started or stopped asking to chat with us
    ChatRequest { peer: PeerId, pending: bool },
}

impl BeaconUpdate {
    pub fn peer(&self) -> PeerId {
        match self {
            BeaconUpdate::Presence { peer, .. } | BeaconUpdate::ChatRequest { peer, .. } => *peer,
        }
    }
}

/// What a beacon sends and how it reads the replies
pub trait Beacon: Send + 'static {
    /// Whether this is a discovery beacon, which selects the cathedral scope.
    fn is_discovery(&self) -> bool;

    /// The bitmap sent with every beacon, if any.
    fn payload(&self) -> Option<&PresenceBitmap>;

    /// Turn a cathedral reply into updates.
    fn interpret(&mut self, peers: &PresenceBitmap) -> Vec<BeaconUpdate>;
}

/// Discovery beacon: who is online
#[derive(Debug, Default)]
pub struct PresenceBeacon {
    last: PresenceBitmap,
}

impl PresenceBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers online as of the last reply
    pub fn online(&self) -> &PresenceBitmap {
        &self.last
    }
}

impl Beacon for PresenceBeacon {
    fn is_discovery(&self) -> bool {
        true
    }

    fn payload(&self) -> Option<&PresenceBitmap> {
        None
    }

    fn interpret(&mut self, peers: &PresenceBitmap) -> Vec<BeaconUpdate> {
        let updates = changes(&self.last, peers)
            .map(|(peer, online)| BeaconUpdate::Presence { peer, online })
            .collect();
        self.last = peers.clone();
        updates
    }
}

/// Signaling beacon: who wants to chat
#[derive(Debug, Default)]
pub struct SignalBeacon {
    intent: PresenceBitmap,
    last: PresenceBitmap,
}

impl SignalBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark whether we want to chat with `peer`. Sent with the next beacon.
    pub fn set_intent(&mut self, peer: PeerId, on: bool) {
        self.intent.set(peer, on);
    }

    /// Peers we currently ask to chat with
    pub fn intent(&self) -> &PresenceBitmap {
        &self.intent
    }

    /// Peers asking to chat with us as of the last reply
    pub fn requests(&self) -> &PresenceBitmap {
        &self.last
    }
}

impl Beacon for SignalBeacon {
    fn is_discovery(&self) -> bool {
        false
    }

    fn payload(&self) -> Option<&PresenceBitmap> {
        Some(&self.intent)
    }

    fn interpret(&mut self, peers: &PresenceBitmap) -> Vec<BeaconUpdate> {
        let updates = changes(&self.last, peers)
            .map(|(peer, pending)| BeaconUpdate::ChatRequest { peer, pending })
            .collect();
        self.last = peers.clone();
        updates
    }
}

fn changes<'a>(
    old: &'a PresenceBitmap,
    new: &'a PresenceBitmap,
) -> impl Iterator<Item = (PeerId, bool)> + 'a {
    PeerId::all()
        .filter(move |peer| old.get(*peer) != new.get(*peer))
        .map(move |peer| (peer, new.get(peer)))
}

/// Drives one beacon against the cathedral
pub struct Liturgy<B, C> {
    beacon: B,
    channel: C,
    group: Option<GroupId>,
    cathedral: SocketAddr,
    outbox: Outbox,
    transmits: VecDeque<Transmit>,
    updates: VecDeque<BeaconUpdate>,
}

impl<B: Beacon, C: SecureChannel> Liturgy<B, C> {
    /// Set up a beacon, scoped to `group` when given.
    ///
    /// Fails if the configuration lacks what the beacon needs or if the
    /// secure channel rejects it. Nothing is sent until [`Liturgy::send`].
    pub fn new(
        settings: &Settings,
        beacon: B,
        group: Option<GroupId>,
        mut channel: C,
    ) -> LitanyResult<Self> {
        let config = settings.beacon_config(beacon.is_discovery(), group)?;
        channel.configure(&config)?;

        info!(
            discovery = beacon.is_discovery(),
            group = ?group,
            cathedral = %settings.cathedral,
            "Liturgy created"
        );

        Ok(Self {
            beacon,
            channel,
            group,
            cathedral: settings.cathedral,
            outbox: Outbox::new(),
            transmits: VecDeque::new(),
            updates: VecDeque::new(),
        })
    }

    pub fn beacon(&self) -> &B {
        &self.beacon
    }

    pub fn beacon_mut(&mut self) -> &mut B {
        &mut self.beacon
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn cathedral(&self) -> SocketAddr {
        self.cathedral
    }

    /// The secure channel driven by this liturgy
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Send one beacon to the cathedral.
    pub fn send(&mut self) -> LitanyResult<()> {
        trace!(discovery = self.beacon.is_discovery(), "Sending liturgy");
        tolerate(
            self.channel
                .liturgy(self.beacon.payload(), &mut self.outbox),
        )?;
        self.flush();
        Ok(())
    }

    /// Feed a datagram read from the socket.
    pub fn handle_datagram(&mut self, packet: &[u8]) -> LitanyResult<()> {
        tolerate(self.channel.decrypt(packet, &mut self.outbox))?;
        self.flush();
        Ok(())
    }

    /// Take the next datagram to write
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Take the next update
    pub fn poll_update(&mut self) -> Option<BeaconUpdate> {
        self.updates.pop_front()
    }

    fn flush(&mut self) {
        while let Some(output) = self.outbox.pop() {
            match output {
                // Everything a beacon sends is for the cathedral
                ChannelOutput::Datagram { data, .. } => self.transmits.push_back(Transmit {
                    dest: self.cathedral,
                    data,
                }),
                ChannelOutput::Plaintext(data) => {
                    debug!(len = data.len(), "Ignoring plaintext on a liturgy");
                }
                ChannelOutput::Event(ChannelEvent::LiturgyReceived { peers }) => {
                    let updates = self.beacon.interpret(&peers);
                    trace!(changes = updates.len(), "Liturgy received");
                    self.updates.extend(updates);
                }
                ChannelOutput::Event(other) => {
                    debug!(event = ?other, "Ignoring channel event");
                }
            }
        }
    }
}

impl<C: SecureChannel> Liturgy<SignalBeacon, C> {
    /// Mark whether we want to chat with `peer`.
    pub fn set_intent(&mut self, peer: PeerId, on: bool) {
        debug!(%peer, on, "Signaling intent changed");
        self.beacon.set_intent(peer, on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockChannel;
    use crate::config::testing::settings;
    use crate::config::DISCOVERY_GROUP_ALL;

    fn peer(id: u8) -> PeerId {
        PeerId::new(id).unwrap()
    }

    fn bitmap(peers: &[u8]) -> PresenceBitmap {
        let mut map = PresenceBitmap::new();
        for id in peers {
            map.set(peer(*id), true);
        }
        map
    }

    fn reply<B: Beacon>(liturgy: &mut Liturgy<B, MockChannel>, peers: &[u8]) -> Vec<BeaconUpdate> {
        liturgy.outbox.event(ChannelEvent::LiturgyReceived {
            peers: bitmap(peers),
        });
        liturgy.flush();
        std::iter::from_fn(|| liturgy.poll_update()).collect()
    }

    #[test]
    fn test_presence_reports_each_change_once() {
        let mut beacon = PresenceBeacon::new();

        assert_eq!(
            beacon.interpret(&bitmap(&[5])),
            vec![BeaconUpdate::Presence {
                peer: peer(5),
                online: true
            }]
        );
        assert!(beacon.interpret(&bitmap(&[5])).is_empty());

        assert_eq!(
            beacon.interpret(&bitmap(&[9])),
            vec![
                BeaconUpdate::Presence {
                    peer: peer(5),
                    online: false
                },
                BeaconUpdate::Presence {
                    peer: peer(9),
                    online: true
                },
            ]
        );
        assert!(beacon.online().get(peer(9)));
    }

    #[test]
    fn test_signal_reports_requests() {
        let mut beacon = SignalBeacon::new();
        let updates = beacon.interpret(&bitmap(&[3]));
        assert_eq!(
            updates,
            vec![BeaconUpdate::ChatRequest {
                peer: peer(3),
                pending: true
            }]
        );
        assert!(beacon.requests().get(peer(3)));
    }

    #[test]
    fn test_signal_payload_carries_intent() {
        let mut beacon = SignalBeacon::new();
        beacon.set_intent(peer(7), true);
        assert!(beacon.payload().unwrap().get(peer(7)));

        beacon.set_intent(peer(7), false);
        assert_eq!(beacon.payload().unwrap().count(), 0);
        assert!(PresenceBeacon::new().payload().is_none());
    }

    #[test]
    fn test_discovery_liturgy_config_and_send() {
        let mut liturgy =
            Liturgy::new(&settings(1), PresenceBeacon::new(), None, MockChannel::default()).unwrap();
        let config = liturgy.channel().configured.clone().unwrap();
        assert_eq!(config.group, DISCOVERY_GROUP_ALL);
        assert_eq!(config.tunnel, 1);

        liturgy.send().unwrap();
        assert_eq!(liturgy.channel().liturgies, vec![None]);

        let transmit = liturgy.poll_transmit().unwrap();
        assert_eq!(transmit.dest, liturgy.cathedral());
    }

    #[test]
    fn test_signal_liturgy_sends_intent() {
        let mut liturgy =
            Liturgy::new(&settings(1), SignalBeacon::new(), None, MockChannel::default()).unwrap();
        assert_eq!(liturgy.channel().configured.as_ref().unwrap().group, 0);

        liturgy.set_intent(peer(4), true);
        liturgy.send().unwrap();

        let sent = liturgy.channel().liturgies[0].clone().unwrap();
        assert_eq!(sent.len(), 255);
        assert_eq!(sent[4], 1);
        assert_eq!(sent.iter().filter(|b| **b != 0).count(), 1);
    }

    #[test]
    fn test_liturgy_reply_feeds_beacon() {
        let mut liturgy =
            Liturgy::new(&settings(1), PresenceBeacon::new(), None, MockChannel::default()).unwrap();

        assert_eq!(
            reply(&mut liturgy, &[5]),
            vec![BeaconUpdate::Presence {
                peer: peer(5),
                online: true
            }]
        );
        assert!(reply(&mut liturgy, &[5]).is_empty());
    }

    #[test]
    fn test_group_liturgy_uses_group_scope() {
        let liturgy = Liturgy::new(
            &settings(1),
            PresenceBeacon::new(),
            Some(GroupId(0x42)),
            MockChannel::default(),
        )
        .unwrap();
        let config = liturgy.channel().configured.clone().unwrap();
        assert_eq!(config.group, 0x42);
        assert_eq!(config.flock, 0xcafebabe02);
        assert_eq!(liturgy.group(), Some(GroupId(0x42)));
    }
}
