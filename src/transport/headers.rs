//! Header Contract
//!
//! Every peer request and response carries the node identity headers
//! `nethash`, `version`, `os` and `port`. Outbound values are fixed once
//! at bind time; inbound values are validated field by field and the
//! first failure message is surfaced to the caller.

use crate::config::SystemInfo;
use crate::peers::{is_valid_os, is_valid_version};

/// Outbound identity headers, set once on bind.
#[derive(Debug, Clone)]
pub struct NodeHeaders {
    pub os: String,
    pub version: String,
    pub port: u16,
    pub nethash: String,
}

impl NodeHeaders {
    pub fn from_system(system: &SystemInfo) -> Self {
        Self {
            os: system.os.clone(),
            version: system.version.clone(),
            port: system.port,
            nethash: system.nethash.clone(),
        }
    }

    /// Header name/value pairs, ready for either HTTP side.
    pub fn pairs(&self) -> [(&'static str, String); 4] {
        [
            ("os", self.os.clone()),
            ("version", self.version.clone()),
            ("port", self.port.to_string()),
            ("nethash", self.nethash.clone()),
        ]
    }
}

/// Identity headers as read off the wire, before validation.
#[derive(Debug, Clone, Default)]
pub struct RawHeaders {
    pub ip: Option<String>,
    pub port: Option<String>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub nethash: Option<String>,
}

impl RawHeaders {
    /// Collect the contract headers through an accessor, keeping this
    /// module independent of either HTTP library's header map.
    pub fn collect(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            ip: None,
            port: get("port"),
            os: get("os"),
            version: get("version"),
            nethash: get("nethash"),
        }
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }
}

/// Validated identity headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHeaders {
    pub port: u16,
    pub os: String,
    pub version: String,
    pub nethash: String,
}

/// Validate the header contract. Returns the first failure message, the
/// way a schema validator would surface it.
pub fn validate(raw: &RawHeaders) -> Result<PeerHeaders, String> {
    if raw.ip.is_none() {
        return Err("Missing required property: ip".into());
    }

    let port = match &raw.port {
        None => return Err("Missing required property: port".into()),
        Some(value) => match value.trim().parse::<u16>() {
            Ok(port) if port >= 1 => port,
            _ => return Err(format!("Invalid port: {}", value)),
        },
    };

    let os = match &raw.os {
        None => return Err("Missing required property: os".into()),
        Some(os) if is_valid_os(os) => os.clone(),
        Some(os) => return Err(format!("Invalid os: {}", os)),
    };

    let version = match &raw.version {
        None => return Err("Missing required property: version".into()),
        Some(version) if is_valid_version(version) => version.clone(),
        Some(version) => return Err(format!("Invalid version: {}", version)),
    };

    let nethash = match &raw.nethash {
        None => return Err("Missing required property: nethash".into()),
        Some(nethash) if nethash.len() == 64 => nethash.clone(),
        Some(nethash) => return Err(format!("Invalid nethash: {}", nethash)),
    };

    Ok(PeerHeaders { port, os, version, nethash })
}
