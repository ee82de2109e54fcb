//! Configuration parsing and validation
//!
//! Litany is configured with a flat JSON object of strings, e.g.:
//!
//! ```json
//! {
//!   "flock": "cafebabe00",
//!   "flock-domain": "01",
//!   "flock-domain-group": "02",
//!   "kek-id": "07",
//!   "kek-path": "/etc/litany/kek-0x07",
//!   "cs-id": "badf00d",
//!   "cs-path": "/etc/litany/cs-badf00d",
//!   "cathedral": "1.2.3.4:4500"
//! }
//! ```
//!
//! Numeric fields are hexadecimal. Every consumer validates what it needs at
//! construction; a tunnel or beacon is never started from a partially valid
//! configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LitanyError, LitanyResult};
use crate::types::{parse_hex, GroupId, PeerId};

/// Group value that scopes a discovery beacon to the whole flock.
pub const DISCOVERY_GROUP_ALL: u16 = u16::MAX;

/// Raw configuration as it appears on disk.
///
/// Values are kept untyped so that a wrong JSON type yields the same
/// diagnostic as a missing field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    pub flock: Option<Value>,
    #[serde(rename = "flock-domain")]
    pub flock_domain: Option<Value>,
    #[serde(rename = "flock-domain-group")]
    pub flock_domain_group: Option<Value>,
    #[serde(rename = "kek-id")]
    pub kek_id: Option<Value>,
    #[serde(rename = "kek-path")]
    pub kek_path: Option<Value>,
    #[serde(rename = "cs-id")]
    pub cs_id: Option<Value>,
    #[serde(rename = "cs-path")]
    pub cs_path: Option<Value>,
    pub cathedral: Option<Value>,
}

/// Validated configuration shared by tunnels and beacons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Flock identifier with the low (domain) byte cleared
    pub flock: u64,
    /// Domain byte for direct chats and the roster beacons
    pub flock_domain: u8,
    /// Domain byte for group chats, if configured
    pub flock_domain_group: Option<u8>,
    /// Our own identity inside the flock
    pub kek_id: PeerId,
    /// Path to the key-encryption key, if configured
    pub kek_path: Option<PathBuf>,
    /// Our identity towards the cathedral
    pub cs_id: u32,
    /// Path to the cathedral secret
    pub cs_path: PathBuf,
    /// Rendezvous server address
    pub cathedral: SocketAddr,
}

impl Settings {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> LitanyResult<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| LitanyError::Config(format!("json error: {}", e)))?;
        Self::from_value(value)
    }

    /// Validate an already parsed JSON object.
    pub fn from_value(value: Value) -> LitanyResult<Self> {
        if !value.is_object() {
            return Err(LitanyError::Config("expecting a json object".into()));
        }

        let raw: RawConfig = serde_json::from_value(value)
            .map_err(|e| LitanyError::Config(format!("json error: {}", e)))?;
        Self::from_raw(&raw)
    }

    /// Validate a raw configuration.
    pub fn from_raw(raw: &RawConfig) -> LitanyResult<Self> {
        let flock = number(&raw.flock, "flock", u64::MAX)?;
        if flock & 0xff != 0 {
            return Err(LitanyError::Config(
                "flock invalid (contains domain bits)".into(),
            ));
        }

        let flock_domain = number(&raw.flock_domain, "flock-domain", u8::MAX as u64)? as u8;

        let flock_domain_group = match raw.flock_domain_group {
            Some(_) => Some(number(
                &raw.flock_domain_group,
                "flock-domain-group",
                u8::MAX as u64,
            )? as u8),
            None => None,
        };

        let kek_id = number(&raw.kek_id, "kek-id", u8::MAX as u64)? as u8;
        let kek_id = PeerId::new(kek_id)
            .ok_or_else(|| LitanyError::Config("kek-id out of range".into()))?;

        let kek_path = match raw.kek_path {
            Some(_) => Some(PathBuf::from(string(&raw.kek_path, "kek-path")?)),
            None => None,
        };

        let cs_id = number(&raw.cs_id, "cs-id", u32::MAX as u64)? as u32;
        let cs_path = PathBuf::from(string(&raw.cs_path, "cs-path")?);

        let cathedral = string(&raw.cathedral, "cathedral")?;
        let cathedral = cathedral.parse::<SocketAddr>().map_err(|_| {
            LitanyError::Config(format!("invalid cathedral address {}", cathedral))
        })?;

        Ok(Self {
            flock,
            flock_domain,
            flock_domain_group,
            kek_id,
            kek_path,
            cs_id,
            cs_path,
            cathedral,
        })
    }

    fn group_domain(&self) -> LitanyResult<u8> {
        self.flock_domain_group.ok_or_else(|| {
            LitanyError::Config("no or invalid 'flock-domain-group' found in configuration".into())
        })
    }

    /// Derive the secure channel configuration for a tunnel to `peer`.
    pub fn tunnel_config(&self, peer: PeerId, group: Option<GroupId>) -> LitanyResult<CathedralConfig> {
        let kek = self.kek_path.clone().ok_or_else(|| {
            LitanyError::Config("no or invalid 'kek-path' found in configuration".into())
        })?;

        let (domain, group) = match group {
            Some(group) => (self.group_domain()?, group.get()),
            None => (self.flock_domain, 0),
        };

        Ok(CathedralConfig {
            flock: self.flock | u64::from(domain),
            group,
            tunnel: (u16::from(self.kek_id.get()) << 8) | u16::from(peer.get()),
            identity: self.cs_id,
            kek: Some(kek),
            secret: self.cs_path.clone(),
        })
    }

    /// Derive the secure channel configuration for a beacon.
    ///
    /// A discovery beacon outside of a group listens to the whole flock.
    pub fn beacon_config(&self, discovery: bool, group: Option<GroupId>) -> LitanyResult<CathedralConfig> {
        let (domain, group) = match group {
            Some(group) => (self.group_domain()?, group.get()),
            None if discovery => (self.flock_domain, DISCOVERY_GROUP_ALL),
            None => (self.flock_domain, 0),
        };

        Ok(CathedralConfig {
            flock: self.flock | u64::from(domain),
            group,
            tunnel: u16::from(self.kek_id.get()),
            identity: self.cs_id,
            kek: None,
            secret: self.cs_path.clone(),
        })
    }
}

/// Parameters the secure channel needs to talk to the cathedral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CathedralConfig {
    /// Flock identifier including the domain byte
    pub flock: u64,
    /// Group scope, 0 when not in a group
    pub group: u16,
    /// Tunnel identifier (local id in the high byte for tunnels)
    pub tunnel: u16,
    /// Cathedral identity
    pub identity: u32,
    /// Key-encryption key path (tunnels only)
    pub kek: Option<PathBuf>,
    /// Cathedral secret path
    pub secret: PathBuf,
}

fn string(value: &Option<Value>, field: &str) -> LitanyResult<String> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        _ => Err(LitanyError::Config(format!(
            "no or invalid '{}' found in configuration",
            field
        ))),
    }
}

fn number(value: &Option<Value>, field: &str, max: u64) -> LitanyResult<u64> {
    let s = string(value, field)?;
    let parsed =
        parse_hex(&s).ok_or_else(|| LitanyError::Config(format!("invalid {}: {}", field, s)))?;

    if parsed > max {
        return Err(LitanyError::Config(format!("{} out of range", field)));
    }

    Ok(parsed)
}
