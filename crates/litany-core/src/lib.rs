//! Litany Core Library
//!
//! Reliable, presence-aware peer chat over plain UDP.
//!
//! ## Overview
//!
//! Encryption and key exchange are done by an external secure channel
//! ([`SecureChannel`]). On top of it Litany provides:
//!
//! - **Reliable delivery**: text is tracked in a [`MessageRegistry`] and
//!   retransmitted until the peer acknowledges it.
//! - **Sessions**: a [`Tunnel`] keeps one peer session alive with heartbeats,
//!   cathedral notifications, NAT probes and offline detection.
//! - **Beacons**: a [`Liturgy`] tells the cathedral (the rendezvous server)
//!   who we are and who we want to talk to, and learns who is online and who
//!   wants to talk to us.
//! - **Liveness**: a [`Roster`] turns beacon replies into per-peer state.
//!
//! The core types do no I/O. The [`runtime`] module drives them on tokio.
//!
//! ## Quick Start
//!
//! ```ignore
//! use litany_core::{Settings, Tunnel, TunnelHandle, Transcript};
//!
//! let settings = Settings::from_json(&config)?;
//! let (events, mut rx) = tokio::sync::broadcast::channel(256);
//!
//! let tunnel = Tunnel::new(&settings, "0x07".parse()?, None, channel)?;
//! let handle = TunnelHandle::spawn(tunnel, events).await?;
//!
//! handle.send_text("hello").await?;
//!
//! let mut transcript = Transcript::new();
//! while let Ok(event) = rx.recv().await {
//!     transcript.apply(&event);
//! }
//! ```

pub mod beacon;
pub mod channel;
pub mod config;
pub mod error;
pub mod liveness;
pub mod logging;
pub mod message;
pub mod runtime;
pub mod transcript;
pub mod tunnel;
pub mod types;

// Re-exports
pub use beacon::{Beacon, BeaconUpdate, Liturgy, PresenceBeacon, SignalBeacon};
pub use channel::{ChannelError, ChannelEvent, ChannelOutput, Destination, Outbox, SecureChannel};
pub use config::{CathedralConfig, RawConfig, Settings};
pub use error::{LitanyError, LitanyResult};
pub use liveness::{PeerDisplay, PeerLabel, PeerState, Roster, RosterChange};
pub use message::{MessageKind, MessageRegistry, Record};
pub use runtime::{BeaconHandle, GroupChat, Lobby, TunnelHandle};
pub use transcript::{MessageCategory, Transcript, TranscriptLine};
pub use tunnel::{Transmit, Tunnel, TunnelEvent};
pub use types::*;
