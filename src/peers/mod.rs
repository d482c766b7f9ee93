//! Peer Directory
//!
//! Durable, queryable directory of known peers:
//! - State machine (banned / disconnected / connected) with a ban clock
//! - Frozen whitelist of configured seeds, immune to ban and removal
//! - Seed bootstrap and periodic peer-exchange refresh
//! - Periodic ban expiry
//! - Suppression cache for recently removed peers

pub mod directory;
pub mod peer;
pub mod removed;
pub mod store;

pub use directory::{DirectoryStats, PeerDirectory};
pub use peer::{
    inspect, is_valid_os, is_valid_version, version_lt, Peer, PeerState, PeerUpdate, RawPeer,
};
pub use removed::RemovedCache;
pub use store::{FilterQuery, MemoryPeerStore, OrderBy, PeerStore, SortField, StoreError};

use async_trait::async_trait;
use serde_json::Value;

use crate::sequence::SequenceError;
use crate::transport::TransportError;

/// Peer-exchange capability the directory consumes. Implemented by the
/// transport's outbound client and injected after construction.
#[async_trait]
pub trait PeerExchange: Send + Sync {
    /// Fetch `/peer/list` from one reachable random peer and return the
    /// response body.
    async fn fetch_peer_list(&self) -> Result<Value, TransportError>;
}

/// Directory errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    /// The target peer is a configured seed.
    #[error("Peer in white list")]
    WhiteListed,

    /// Peer version below the configured minimum.
    #[error("Invalid peer version: {0}")]
    InvalidVersion(String),

    /// Malformed filter input on the management API.
    #[error("{0}")]
    InvalidFilter(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
