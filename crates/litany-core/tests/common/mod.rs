//! Shared test fixtures
//!
//! `LoopbackChannel` stands in for the secure channel. It does no
//! cryptography: every datagram is a one-byte tag followed by the payload.
//!
//! | Tag    | Direction         | Meaning                                  |
//! |--------|-------------------|------------------------------------------|
//! | `0x01` | peer ↔ peer       | wire record                              |
//! | `0x02` | → cathedral       | liturgy, optionally followed by a bitmap |
//! | `0x03` | → cathedral       | presence notification                    |
//! | `0x04` | → cathedral + 1   | NAT probe                                |
//! | `0x05` | cathedral →       | liturgy reply with a presence bitmap     |
//! | `0x06` | cathedral →       | keys info: tx u32, rx u32, peer u64      |
//! | `0x07` | cathedral →       | peer discovery: ip (4), port (2)         |

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use litany_core::{
    CathedralConfig, ChannelError, ChannelEvent, Destination, Outbox, PeerId, PresenceBitmap,
    SecureChannel, Settings,
};

pub const TAG_RECORD: u8 = 0x01;
pub const TAG_LITURGY: u8 = 0x02;
pub const TAG_NOTIFY: u8 = 0x03;
pub const TAG_NAT: u8 = 0x04;
pub const TAG_LITURGY_REPLY: u8 = 0x05;
pub const TAG_KEYS: u8 = 0x06;
pub const TAG_DISCOVERY: u8 = 0x07;

/// Settings for local identity `kek_id` talking to `cathedral`.
pub fn settings(kek_id: u8, cathedral: SocketAddr) -> Settings {
    Settings::from_value(json!({
        "flock": "cafebabe00",
        "flock-domain": "01",
        "flock-domain-group": "02",
        "kek-id": format!("{:02x}", kek_id),
        "kek-path": "/tmp/litany-test-kek",
        "cs-id": "badf00d",
        "cs-path": "/tmp/litany-test-cs",
        "cathedral": cathedral.to_string(),
    }))
    .unwrap()
}

pub fn peer(id: u8) -> PeerId {
    PeerId::new(id).unwrap()
}

pub fn bitmap(peers: &[u8]) -> PresenceBitmap {
    let mut map = PresenceBitmap::new();
    for id in peers {
        map.set(peer(*id), true);
    }
    map
}

/// Rewrite a wildcard bind address to localhost.
pub fn loopback(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
}

/// A secure channel that passes everything through in the clear
#[derive(Debug, Clone, Default)]
pub struct LoopbackChannel {
    pub configured: Arc<Mutex<Option<CathedralConfig>>>,
    /// Returned by every `key_maintenance` call while set
    pub key_error: Arc<Mutex<Option<ChannelError>>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose key maintenance fails with `err`.
    pub fn failing(err: ChannelError) -> Self {
        let channel = Self::default();
        *channel.key_error.lock() = Some(err);
        channel
    }
}

impl SecureChannel for LoopbackChannel {
    fn configure(&mut self, config: &CathedralConfig) -> Result<(), ChannelError> {
        *self.configured.lock() = Some(config.clone());
        Ok(())
    }

    fn encrypt(&mut self, record: &[u8], out: &mut Outbox) -> Result<(), ChannelError> {
        out.datagram(Destination::Peer, tagged(TAG_RECORD, record));
        Ok(())
    }

    fn decrypt(&mut self, packet: &[u8], out: &mut Outbox) -> Result<(), ChannelError> {
        let Some((tag, body)) = packet.split_first() else {
            return Ok(());
        };

        match *tag {
            TAG_RECORD => out.plaintext(body.to_vec()),
            TAG_LITURGY_REPLY => out.event(ChannelEvent::LiturgyReceived {
                peers: PresenceBitmap::from_slice(body),
            }),
            TAG_KEYS if body.len() == 16 => out.event(ChannelEvent::KeysInfo {
                tx_spi: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                rx_spi: u32::from_be_bytes(body[4..8].try_into().unwrap()),
                peer_id: u64::from_be_bytes(body[8..16].try_into().unwrap()),
            }),
            TAG_DISCOVERY if body.len() == 6 => out.event(ChannelEvent::PeerDiscovery {
                ip: body[0..4].try_into().unwrap(),
                port: body[4..6].try_into().unwrap(),
            }),
            // Anything else fails authentication and is dropped
            _ => {}
        }
        Ok(())
    }

    fn key_maintenance(&mut self, _out: &mut Outbox) -> Result<(), ChannelError> {
        match self.key_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn notify_presence(&mut self, out: &mut Outbox) -> Result<(), ChannelError> {
        out.datagram(Destination::Cathedral, vec![TAG_NOTIFY]);
        Ok(())
    }

    fn probe_nat(&mut self, out: &mut Outbox) -> Result<(), ChannelError> {
        out.datagram(Destination::CathedralNat, vec![TAG_NAT]);
        Ok(())
    }

    fn liturgy(
        &mut self,
        intent: Option<&PresenceBitmap>,
        out: &mut Outbox,
    ) -> Result<(), ChannelError> {
        let body = intent.map(|map| map.as_bytes()).unwrap_or_default();
        out.datagram(Destination::Cathedral, tagged(TAG_LITURGY, body));
        Ok(())
    }
}

pub fn tagged(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(body.len() + 1);
    packet.push(tag);
    packet.extend_from_slice(body);
    packet
}

/// A scripted rendezvous server on localhost
pub struct FakeCathedral {
    socket: UdpSocket,
}

impl FakeCathedral {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    /// Wait for the next datagram with the given tag.
    pub async fn recv_tagged(&self, tag: u8) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; 2048];
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let (len, from) = self.socket.recv_from(&mut buf).await.unwrap();
                if len > 0 && buf[0] == tag {
                    return (buf[1..len].to_vec(), from);
                }
            }
        })
        .await
        .expect("cathedral timed out waiting for datagram")
    }

    pub async fn reply_liturgy(&self, to: SocketAddr, peers: &PresenceBitmap) {
        self.send(to, &tagged(TAG_LITURGY_REPLY, peers.as_bytes())).await;
    }

    /// Tell `to` that its peer lives at `peer_addr`.
    pub async fn send_discovery(&self, to: SocketAddr, peer_addr: SocketAddr) {
        let SocketAddr::V4(v4) = peer_addr else {
            panic!("ipv4 only");
        };
        let mut body = v4.ip().octets().to_vec();
        body.extend_from_slice(&v4.port().to_be_bytes());
        self.send(to, &tagged(TAG_DISCOVERY, &body)).await;
    }

    pub async fn send(&self, to: SocketAddr, packet: &[u8]) {
        self.socket.send_to(packet, loopback(to)).await.unwrap();
    }
}

/// Receive from a broadcast channel until `pred` matches.
pub async fn wait_for<T, F>(rx: &mut broadcast::Receiver<T>, mut pred: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(item) if pred(&item) => return item,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
