//! Node Configuration
//!
//! Configuration options for the PeerMesh node: network identity, seed
//! peers, listen addresses and peer-exchange tuning.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Nethash of the public main network.
pub const MAINNET_NETHASH: &str =
    "9a5a8a38bd2f63caa0b7ef712c979a0b5dfbbbbbcb2fc2e5ba50cfb0708a2ffa";

/// Nethash of the public test network.
pub const TESTNET_NETHASH: &str =
    "da3ed6a45429278bac2666961289ca17ad86595d33b31037615d4b8e8f158bba";

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    /// Local development
    Devnet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Devnet => write!(f, "devnet"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" | "local" => Ok(Network::Devnet),
            _ => Err(format!("Unknown network: {}", s)),
        }
    }
}

/// A configured seed peer. Seeds form the frozen whitelist: they are never
/// banned and never removed from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub ip: String,
    pub port: u16,
}

/// Peer-exchange tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerOptions {
    /// Maximum candidates taken from a single `/peer/list` response
    pub max_update_peers: usize,

    /// Outbound request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            max_update_peers: 20,
            timeout_ms: 4000,
        }
    }
}

/// Peer subsystem configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Frozen-whitelist seed peers
    pub list: Vec<SeedPeer>,

    /// Tuning options
    pub options: PeerOptions,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network type (mainnet, testnet, devnet)
    pub network: Network,

    /// Network identifier; peers on different nethashes never exchange data
    pub nethash: String,

    /// Version advertised to peers
    pub version: String,

    /// Oldest peer version accepted at ingest
    pub min_version: String,

    /// Build string reported by the management API
    pub build: String,

    /// Listen address for the `/peer` protocol API; the port is also the
    /// port advertised in outbound headers
    pub peer_addr: SocketAddr,

    /// Listen address for the `/api` management API
    pub api_addr: SocketAddr,

    /// Log level
    pub log_level: String,

    /// Peer subsystem configuration
    pub peers: PeersConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            nethash: TESTNET_NETHASH.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            min_version: "0.3.0".into(),
            build: String::new(),
            peer_addr: "0.0.0.0:7000".parse().unwrap(),
            api_addr: "127.0.0.1:7001".parse().unwrap(),
            log_level: "info".into(),
            peers: PeersConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create testnet configuration
    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            nethash: TESTNET_NETHASH.into(),
            peers: PeersConfig {
                list: vec![
                    SeedPeer { ip: "94.237.28.66".into(), port: 7000 },
                    SeedPeer { ip: "209.50.49.23".into(), port: 7000 },
                ],
                options: PeerOptions::default(),
            },
            ..Default::default()
        }
    }

    /// Create mainnet configuration
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            nethash: MAINNET_NETHASH.into(),
            peer_addr: "0.0.0.0:8000".parse().unwrap(),
            api_addr: "127.0.0.1:8001".parse().unwrap(),
            peers: PeersConfig {
                list: vec![
                    SeedPeer { ip: "108.61.77.24".into(), port: 8000 },
                    SeedPeer { ip: "45.32.134.42".into(), port: 8000 },
                    SeedPeer { ip: "104.238.166.98".into(), port: 8000 },
                ],
                options: PeerOptions::default(),
            },
            ..Default::default()
        }
    }

    /// Create devnet configuration for local testing. No seeds: a devnet
    /// node starts from an empty directory and learns peers inbound.
    pub fn devnet() -> Self {
        Self {
            network: Network::Devnet,
            nethash: "cd".repeat(32),
            peer_addr: "127.0.0.1:7000".parse().unwrap(),
            min_version: "0.0.0".into(),
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: NodeConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nethash.len() != 64 || hex::decode(&self.nethash).is_err() {
            return Err(ConfigError::Invalid(
                "Nethash must be a 64-character hex string".into(),
            ));
        }

        for v in [&self.version, &self.min_version] {
            if !crate::peers::is_valid_version(v) {
                return Err(ConfigError::Invalid(format!("Malformed version: {}", v)));
            }
        }

        for seed in &self.peers.list {
            if seed.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Seed peer {} has no port",
                    seed.ip
                )));
            }
        }

        if self.peers.options.max_update_peers == 0 {
            return Err(ConfigError::Invalid(
                "max_update_peers must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get default configuration file path
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("peermesh").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("peermesh.json"))
}

/// Node identity advertised to peers, built once from configuration.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// Operating system tag, e.g. `linux-x86_64`
    pub os: String,
    /// Version advertised to peers
    pub version: String,
    /// Oldest accepted peer version
    pub min_version: String,
    /// Port the `/peer` API is reachable on
    pub port: u16,
    /// Network identifier
    pub nethash: String,
    /// Build string for the management API
    pub build: String,
}

impl SystemInfo {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            os: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            version: config.version.clone(),
            min_version: config.min_version.clone(),
            port: config.peer_addr.port(),
            nethash: config.nethash.clone(),
            build: config.build.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.peers.options.max_update_peers, 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(NodeConfig::testnet().nethash, TESTNET_NETHASH);
        assert_eq!(NodeConfig::mainnet().nethash, MAINNET_NETHASH);
        assert!(NodeConfig::mainnet().validate().is_ok());
        assert!(NodeConfig::devnet().peers.list.is_empty());
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("test".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("dev".parse::<Network>().unwrap(), Network::Devnet);
        assert!("other".parse::<Network>().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NodeConfig::testnet();
        assert!(config.validate().is_ok());

        config.nethash = "not-hex".into();
        assert!(config.validate().is_err());

        config = NodeConfig::testnet();
        config.min_version = "5".into();
        assert!(config.validate().is_err());

        config = NodeConfig::testnet();
        config.peers.list.push(SeedPeer { ip: "1.2.3.4".into(), port: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_config() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");

        let config = NodeConfig::testnet();
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.network, config.network);
        assert_eq!(loaded.nethash, config.nethash);
        assert_eq!(loaded.peers.list, config.peers.list);
    }

    #[test]
    fn test_system_info() {
        let config = NodeConfig::testnet();
        let info = SystemInfo::from_config(&config);
        assert_eq!(info.port, 7000);
        assert_eq!(info.nethash, config.nethash);
        assert!(!info.os.is_empty() && info.os.len() < 64);
    }
}
