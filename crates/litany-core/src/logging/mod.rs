//! Per-process logging with JSONL storage.
//!
//! The roster and every chat window run as separate processes. Each one
//! logs to its own file so they can all be merged afterwards:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-19_roster.jsonl
//!     ├── 2026-10-19_chat-07.jsonl
//!     └── 2026-10-19_group-0042.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use litany_core::logging::{init_logging, JsonlLayer, LogInstance};
//!
//! let layer = JsonlLayer::new("./logs", LogInstance::Chat(peer))?;
//! init_logging(1, Some(layer))?;
//! ```
//!
//! ## Querying logs with jq
//!
//! ```bash
//! # Everything one chat window saw
//! jq 'select(.instance == "chat-07")' logs/raw/*.jsonl
//!
//! # Datagrams that failed to go out
//! jq 'select(.msg == "Failed to write datagram")' logs/raw/*.jsonl
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::EnvFilter;

pub use entry::{JsonLogEntry, LogInstance};
pub use layer::JsonlLayer;
pub use writer::{read_all_entries, read_instance_entries, InstanceLogWriter};

/// Default filter for a verbosity level (number of `-v` flags).
pub fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber: console output plus the optional JSONL
/// layer. `RUST_LOG` takes precedence over `verbosity`.
pub fn init_logging(verbosity: u8, jsonl: Option<JsonlLayer>) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(jsonl)
        .try_init()
}
