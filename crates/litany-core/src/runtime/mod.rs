//! Tokio drivers for tunnels and beacons
//!
//! Each [`Tunnel`](crate::tunnel::Tunnel) and [`Liturgy`](crate::beacon::Liturgy)
//! runs in its own task with its own UDP socket. Tasks share no mutable
//! state: commands go in over an mpsc channel, events come out over a
//! broadcast channel. Beacon updates are change-only, so they travel over an
//! unbounded mpsc channel to their single consumer and are never dropped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Lobby                                                        │
//! │  ├── discovery: BeaconHandle<PresenceBeacon> ─┐               │
//! │  ├── signaling: BeaconHandle<SignalBeacon>  ──┴► mpsc ─┐      │
//! │  └── roster:    Roster ◄───────────────────────────────┘      │
//! │                 └──► broadcast::Sender<RosterChange>          │
//! │                                                               │
//! │  GroupChat                                                    │
//! │  ├── discovery: BeaconHandle<PresenceBeacon> (group scoped)   │
//! │  └── tunnels:   PeerId ─► TunnelHandle (JoinSet of members)   │
//! │                 └──► broadcast::Sender<TunnelEvent> (shared)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping any handle aborts its task. Pending messages are discarded,
//! nothing is flushed.

mod beacon;
mod group;
mod lobby;
mod tunnel;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::warn;

use crate::tunnel::Transmit;

pub use beacon::BeaconHandle;
pub use group::GroupChat;
pub use lobby::Lobby;
pub use tunnel::TunnelHandle;

/// Default capacity for event broadcast channels
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the per-task command channels
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Largest datagram read from a socket
pub const MAX_DATAGRAM: usize = 1500;

/// Every task binds its own ephemeral port on all interfaces.
const BIND_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::UNSPECIFIED, 0);

async fn bind() -> std::io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::from(BIND_ADDR)).await
}

/// Current time on the tokio clock.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Write out queued datagrams. Failures are logged and dropped.
async fn send_all(socket: &UdpSocket, transmits: Vec<Transmit>) {
    for transmit in transmits {
        if let Err(err) = socket.send_to(&transmit.data, transmit.dest).await {
            warn!(dest = %transmit.dest, error = %err, "Failed to write datagram");
        }
    }
}
