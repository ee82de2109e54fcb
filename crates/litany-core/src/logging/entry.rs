//! One line of a JSONL log file.
//!
//! Every line is a self-contained JSON object, so files written by the
//! roster, chat and group processes can be merged without coordination.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GroupId, PeerId};

/// Which process is logging
///
/// The application runs one process for the roster and one per open chat
/// window. Each gets its own log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogInstance {
    /// The roster window with its discovery and signaling beacons
    Roster,
    /// A direct chat with one peer
    Chat(PeerId),
    /// A group chat
    Group(GroupId),
}

impl fmt::Display for LogInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogInstance::Roster => write!(f, "roster"),
            LogInstance::Chat(peer) => write!(f, "chat-{}", peer),
            LogInstance::Group(group) => write!(f, "group-{}", group),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Instance name, e.g. "chat-07"
    pub instance: String,

    /// Module path, e.g. "litany_core::tunnel"
    pub target: String,

    pub msg: String,

    /// Structured fields (peer, id, len, addr, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Look up a structured field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|fields| fields.get(name))
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
