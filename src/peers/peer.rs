//! Peer Records
//!
//! Wire-shaped peer input, the stored peer row, and the `inspect`
//! normalization that bridges the two.

use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;

/// Peer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Banned until the ban clock expires
    Banned,
    /// Known but not currently exchanging data
    Disconnected,
    /// Framed us recently or answered an outbound request
    Connected,
}

impl PeerState {
    pub fn as_u8(self) -> u8 {
        match self {
            PeerState::Banned => 0,
            PeerState::Disconnected => 1,
            PeerState::Connected => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PeerState::Banned),
            1 => Some(PeerState::Disconnected),
            2 => Some(PeerState::Connected),
            _ => None,
        }
    }
}

// Peer state travels as a bare integer on the wire.
impl Serialize for PeerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for PeerState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        PeerState::from_u8(value)
            .ok_or_else(|| D::Error::custom(format!("invalid peer state {}", value)))
    }
}

/// A stored peer row. `(ip, port)` is the primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    pub state: PeerState,
    pub os: String,
    pub version: String,
    /// Absolute millisecond timestamp at which a ban expires. Always set
    /// when banned, never otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<u64>,
}

impl Peer {
    /// `ip:port` label, for logging only.
    pub fn label(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// A peer record as received from the network, before normalization.
/// Remote nodes are loose about field types, so everything is optional
/// and numbers are accepted where strings belong.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawPeer {
    #[serde(default, deserialize_with = "de_loose_string")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "de_loose_port")]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "de_loose_state")]
    pub state: Option<u8>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dappid: Option<String>,
}

/// Upsert payload produced by [`inspect`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeerUpdate {
    pub ip: Option<String>,
    pub port: u16,
    /// Written when present; defaults to disconnected on insert and is
    /// left untouched on update.
    pub state: Option<PeerState>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub dappid: Option<String>,
}

impl PeerUpdate {
    /// `ip:port` label, or "unknown" when the ip is absent.
    pub fn label(&self) -> String {
        match &self.ip {
            Some(ip) => format!("{}:{}", ip, self.port),
            None => "unknown".into(),
        }
    }
}

/// Normalize a raw peer record. Decimal-integer ips are converted from
/// 32-bit long form to dotted quad, the port is coerced (unparsable
/// becomes 0), and `os`/`version` receive their defaults. Pure; never
/// fails.
pub fn inspect(raw: &RawPeer) -> PeerUpdate {
    let ip = raw.ip.as_deref().map(|ip| {
        if !ip.is_empty() && ip.bytes().all(|b| b.is_ascii_digit()) {
            match ip.parse::<u32>() {
                Ok(long) => Ipv4Addr::from(long).to_string(),
                Err(_) => ip.to_string(),
            }
        } else {
            ip.to_string()
        }
    });

    PeerUpdate {
        ip,
        port: raw.port.unwrap_or(0),
        state: raw.state.and_then(PeerState::from_u8),
        os: Some(raw.os.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| "unknown".into())),
        version: Some(raw.version.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| "0.0.0".into())),
        dappid: raw.dappid.clone(),
    }
}

/// Check the `version` wire format: `major.minor.patch` with an optional
/// trailing lowercase letter, 5 to 12 characters.
pub fn is_valid_version(version: &str) -> bool {
    if version.len() < 5 || version.len() > 12 {
        return false;
    }
    parse_version(version).is_some()
}

/// Check the `os` wire format: 1 to 64 characters from `[a-zA-Z0-9._+-]`.
pub fn is_valid_os(os: &str) -> bool {
    !os.is_empty()
        && os.len() <= 64
        && os
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'+' | b'-'))
}

/// Numeric version ordering: `a < b`. Unparsable versions compare as
/// `0.0.0`, so they fail any nonzero minimum.
pub fn version_lt(a: &str, b: &str) -> bool {
    parse_version(a).unwrap_or((0, 0, 0)) < parse_version(b).unwrap_or((0, 0, 0))
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let trimmed = version.strip_suffix(|c: char| c.is_ascii_lowercase()).unwrap_or(version);
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

fn de_loose_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn de_loose_port<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    })
}

fn de_loose_state<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_u64().and_then(|v| u8::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<u8>().ok(),
        _ => None,
    })
}
