//! Session manager for a single peer
//!
//! A [`Tunnel`] keeps one reliable, presence-aware session to a peer on top
//! of the secure channel. It does no I/O: the owner feeds it datagrams and
//! timer ticks, then drains the datagrams it wants written
//! ([`Tunnel::poll_transmit`]) and the notifications it produced
//! ([`Tunnel::poll_event`]).
//!
//! ## Timers
//!
//! ```text
//! manage  (every 500ms) ── key maintenance
//!                       ├─ every 5s:  notify cathedral + probe NAT
//!                       ├─ every 1s:  heartbeat
//!                       └─ 10s quiet: peer offline (reported once)
//! resend  (every 1s)    ── retransmit pending messages older than 5s
//! ```

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::channel::{tolerate, ChannelEvent, ChannelOutput, Destination, Outbox, SecureChannel};
use crate::config::Settings;
use crate::error::LitanyResult;
use crate::message::{MessageKind, MessageRegistry, Record, RecordError};
use crate::types::{GroupId, PeerId};

/// How often [`Tunnel::manage`] should run.
pub const MANAGE_INTERVAL: Duration = Duration::from_millis(500);

/// How often [`Tunnel::resend_pending`] should run.
pub const RESEND_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between cathedral notifications and NAT probes.
pub const NOTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Silence after which the peer is considered offline.
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shown when the peer goes quiet.
pub const OFFLINE_NOTICE: &str = "[peer]: offline (peer closed window or timeout)";

/// A datagram the owner should write to the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub dest: SocketAddr,
    pub data: Bytes,
}

/// Notifications for the chat window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Text received from the peer
    Message { peer: PeerId, id: u64, text: String },
    /// Locally synthesized status line
    System { peer: PeerId, text: String },
    /// Traffic from the peer started or resumed
    PeerOnline { peer: PeerId },
    /// The peer has been quiet for [`OFFLINE_TIMEOUT`]
    PeerOffline { peer: PeerId },
}

impl TunnelEvent {
    /// The peer this event concerns
    pub fn peer(&self) -> PeerId {
        match self {
            TunnelEvent::Message { peer, .. }
            | TunnelEvent::System { peer, .. }
            | TunnelEvent::PeerOnline { peer }
            | TunnelEvent::PeerOffline { peer } => *peer,
        }
    }
}

/// One session to one peer
pub struct Tunnel<C> {
    peer: PeerId,
    group: Option<GroupId>,
    channel: C,
    registry: MessageRegistry,
    cathedral: SocketAddr,
    /// Best-known peer address; the cathedral until discovery says otherwise
    peer_addr: SocketAddr,
    last_notify: Option<Instant>,
    last_heartbeat: Option<Instant>,
    /// Last sign of life from the peer, cleared once offline is reported
    last_update: Option<Instant>,
    outbox: Outbox,
    transmits: VecDeque<Transmit>,
    events: VecDeque<TunnelEvent>,
}

impl<C: SecureChannel> Tunnel<C> {
    /// Set up a session to `peer`.
    ///
    /// Fails if the configuration lacks what a tunnel needs or if the secure
    /// channel rejects it.
    pub fn new(
        settings: &Settings,
        peer: PeerId,
        group: Option<GroupId>,
        mut channel: C,
    ) -> LitanyResult<Self> {
        let config = settings.tunnel_config(peer, group)?;
        channel.configure(&config)?;

        info!(%peer, cathedral = %settings.cathedral, "Tunnel created");

        let mut tunnel = Self {
            peer,
            group,
            channel,
            registry: MessageRegistry::new(settings.kek_id),
            cathedral: settings.cathedral,
            peer_addr: settings.cathedral,
            last_notify: None,
            last_heartbeat: None,
            last_update: None,
            outbox: Outbox::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        };

        tunnel.system_msg(format!("[cathedral]: address {}", settings.cathedral));
        Ok(tunnel)
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    /// The address peer datagrams currently go to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn cathedral(&self) -> SocketAddr {
        self.cathedral
    }

    /// Messages still waiting for an ack
    pub fn pending(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Whether the peer has been heard from since the last offline notice
    pub fn is_alive(&self) -> bool {
        self.last_update.is_some()
    }

    /// The secure channel driven by this tunnel
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Periodic housekeeping, see the module docs for the cadence.
    pub fn manage(&mut self, now: Instant) -> LitanyResult<()> {
        tolerate(self.channel.key_maintenance(&mut self.outbox))?;

        if is_due(self.last_notify, now, NOTIFY_INTERVAL) {
            self.last_notify = Some(now);
            tolerate(self.channel.notify_presence(&mut self.outbox))?;
            tolerate(self.channel.probe_nat(&mut self.outbox))?;
        }

        if is_due(self.last_heartbeat, now, HEARTBEAT_INTERVAL) {
            self.last_heartbeat = Some(now);
            self.encrypt(&Record::heartbeat())?;
        }

        if let Some(last) = self.last_update {
            if now.saturating_duration_since(last) >= OFFLINE_TIMEOUT {
                info!(peer = %self.peer, "Peer went offline");
                self.last_update = None;
                self.system_msg(OFFLINE_NOTICE.to_string());
                self.events
                    .push_back(TunnelEvent::PeerOffline { peer: self.peer });
            }
        }

        self.flush(now)
    }

    /// Retransmit every message that has waited too long for its ack.
    pub fn resend_pending(&mut self, now: Instant) -> LitanyResult<()> {
        for record in self.registry.sweep(now) {
            trace!(peer = %self.peer, id = record.id, "Resending message");
            self.encrypt(&record)?;
        }
        self.flush(now)
    }

    /// Send text to the peer, retried until acknowledged.
    ///
    /// Returns the message id.
    pub fn send_text(&mut self, text: &[u8], now: Instant) -> LitanyResult<u64> {
        let record = self.registry.register(text, now)?.record.clone();
        debug!(peer = %self.peer, id = record.id, len = text.len(), "Sending text");
        self.encrypt(&record)?;
        self.flush(now)?;
        Ok(record.id)
    }

    /// Acknowledge the text message `id`. Acks are fire-and-forget.
    pub fn send_ack(&mut self, id: u64, now: Instant) -> LitanyResult<()> {
        self.encrypt(&Record::ack(id))?;
        self.flush(now)
    }

    /// Send a heartbeat. Heartbeats are fire-and-forget.
    pub fn send_heartbeat(&mut self, now: Instant) -> LitanyResult<()> {
        self.last_heartbeat = Some(now);
        self.encrypt(&Record::heartbeat())?;
        self.flush(now)
    }

    /// Feed a datagram read from the socket.
    pub fn handle_datagram(&mut self, packet: &[u8], now: Instant) -> LitanyResult<()> {
        tolerate(self.channel.decrypt(packet, &mut self.outbox))?;
        self.flush(now)
    }

    /// Take the next datagram to write
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Take the next notification
    pub fn poll_event(&mut self) -> Option<TunnelEvent> {
        self.events.pop_front()
    }

    fn encrypt(&mut self, record: &Record) -> LitanyResult<()> {
        tolerate(self.channel.encrypt(&record.encode(), &mut self.outbox))?;
        Ok(())
    }

    /// Run every queued channel output to completion. Outputs queued while
    /// handling (acks for received text) are handled in the same pass.
    fn flush(&mut self, now: Instant) -> LitanyResult<()> {
        while let Some(output) = self.outbox.pop() {
            match output {
                ChannelOutput::Datagram { dest, data } => self.socket_send(dest, data),
                ChannelOutput::Plaintext(data) => self.receive(&data, now)?,
                ChannelOutput::Event(event) => self.handle_event(event, now),
            }
        }
        Ok(())
    }

    fn socket_send(&mut self, dest: Destination, data: Bytes) {
        let addr = match dest {
            Destination::Peer => self.peer_addr,
            Destination::Cathedral => self.cathedral,
            Destination::CathedralNat => match self.cathedral.port().checked_add(1) {
                Some(port) => SocketAddr::new(self.cathedral.ip(), port),
                None => {
                    warn!(cathedral = %self.cathedral, "No NAT detection port");
                    return;
                }
            },
        };

        self.transmits.push_back(Transmit { dest: addr, data });
    }

    fn receive(&mut self, data: &[u8], now: Instant) -> LitanyResult<()> {
        let record = match Record::decode(data) {
            Ok(record) => record,
            Err(err @ RecordError::UnknownKind(_)) => {
                // Well formed, so the peer is there
                self.peer_alive(now);
                debug!(peer = %self.peer, error = %err, "Dropping record");
                return Ok(());
            }
            Err(err) => {
                debug!(peer = %self.peer, error = %err, "Dropping record");
                return Ok(());
            }
        };

        self.peer_alive(now);

        match record.kind {
            MessageKind::Text => {
                trace!(peer = %self.peer, id = record.id, "Received text");
                self.events.push_back(TunnelEvent::Message {
                    peer: self.peer,
                    id: record.id,
                    text: record.text_lossy(),
                });
                self.encrypt(&Record::ack(record.id))?;
            }
            MessageKind::Ack => {
                self.registry.ack(record.id);
            }
            MessageKind::Heartbeat => {}
        }

        Ok(())
    }

    fn handle_event(&mut self, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::KeysInfo {
                tx_spi,
                rx_spi,
                peer_id,
            } => {
                self.peer_alive(now);
                self.system_msg(format!(
                    "[tunnel]: tx={:08x} rx={:08x} (peer={:x})",
                    tx_spi, rx_spi, peer_id
                ));
                if tx_spi != 0 && rx_spi != 0 {
                    info!(peer = %self.peer, "Tunnel established");
                    self.system_msg("[tunnel]: established".to_string());
                }
            }
            ChannelEvent::ExchangeInfo { reason } => {
                self.system_msg(format!("[exchange]: {}", reason));
            }
            ChannelEvent::AmbryReceived { generation } => {
                self.system_msg(format!("[cathedral]: got ambry 0x{:08x}", generation));
            }
            ChannelEvent::PeerDiscovery { ip, port } => self.peer_update(ip, port),
            other => debug!(peer = %self.peer, event = ?other, "Ignoring channel event"),
        }
    }

    /// Adopt a peer address learned by the cathedral (network byte order).
    fn peer_update(&mut self, ip: [u8; 4], port: [u8; 2]) {
        let addr = SocketAddr::from((Ipv4Addr::from(ip), u16::from_be_bytes(port)));

        if addr != self.peer_addr {
            info!(peer = %self.peer, %addr, "Peer address changed");
            self.peer_addr = addr;
            self.system_msg(format!("[p2p]: peer address {}", addr));
        }
    }

    fn peer_alive(&mut self, now: Instant) {
        if self.last_update.is_none() {
            self.events
                .push_back(TunnelEvent::PeerOnline { peer: self.peer });
        }
        self.last_update = Some(now);
    }

    fn system_msg(&mut self, text: String) {
        self.events.push_back(TunnelEvent::System {
            peer: self.peer,
            text,
        });
    }
}

fn is_due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) >= interval,
        None => true,
    }
}
