//! Peer Transport
//!
//! Inbound HTTP peer API and outbound peer RPC:
//! - Header contract (nethash, version, os, port) on every request
//! - Framing middleware mutating peer state as a side effect
//! - Gossip fan-out with bounded concurrency
//! - Failure-code policy deciding removal versus timed bans

pub mod client;
pub mod dedup;
pub mod events;
pub mod headers;
pub mod hashsum;
pub mod server;

pub use client::{PeerClient, PeerRequest, PeerResponse, RequestPath};
pub use dedup::MessageDedup;
pub use headers::{NodeHeaders, PeerHeaders, RawHeaders};
pub use hashsum::hashsum;
pub use server::{peer_router, PeerApi};

use crate::peers::{DirectoryError, PeerDirectory};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Ban applied when a peer ships an object that fails normalization
pub const PROTOCOL_BAN_SECS: u64 = 60 * 60;

/// Ban applied on unclassified transport failures
pub const TRANSPORT_BAN_SECS: u64 = 10 * 60;

/// Peers contacted per gossip event
pub const BROADCAST_LIMIT: usize = 100;

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Blockchain is loading")]
    Loading,

    #[error("No reachable peers in db")]
    NoPeers,

    #[error("Request failed: {0}")]
    Http(String),

    #[error("Peer responded with status {0}")]
    BadStatus(u16),

    #[error("Invalid response headers: {0}")]
    BadHeaders(String),

    #[error("Peer is on a different network")]
    NethashMismatch,

    #[error("Invalid response body: {0}")]
    BadBody(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Codes attached to peer-state decisions, for the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    /// Response or request headers failed validation
    Headers,
    /// Peer is on a different network
    Nethash,
    /// Non-200 response status
    Response(u16),
    /// Connection could not be established
    Unavailable,
    /// Request timed out
    Timeout,
    /// Block failed normalization
    Block,
    /// Transaction failed normalization
    Transaction,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Headers => write!(f, "EHEADERS"),
            FailureCode::Nethash => write!(f, "ENETHASH"),
            FailureCode::Response(status) => write!(f, "ERESPONSE {}", status),
            FailureCode::Unavailable => write!(f, "EUNAVAILABLE"),
            FailureCode::Timeout => write!(f, "ETIMEOUT"),
            FailureCode::Block => write!(f, "EBLOCK"),
            FailureCode::Transaction => write!(f, "ETRANSACTION"),
        }
    }
}

/// Transport counters. Shared between the server and the client.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub framed: AtomicU64,
    pub removed: AtomicU64,
    pub banned: AtomicU64,
    pub broadcasts: AtomicU64,
    pub random_attempts: AtomicU64,
}

impl TransportStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Best-effort peer removal. Whitelist refusals and storage problems are
/// logged and swallowed; protocol handling continues either way.
pub(crate) async fn remove_peer(
    directory: &PeerDirectory,
    stats: &TransportStats,
    ip: &str,
    port: u16,
    reason: impl std::fmt::Display,
) {
    let peer = format!("{}:{}", ip, port);
    info!(peer = %peer, %reason, "Removing peer");
    match directory.remove(ip, port).await {
        Ok(()) => TransportStats::bump(&stats.removed),
        Err(e) => debug!(peer = %peer, error = %e, "peer removal failed"),
    }
}

/// Best-effort timed ban, same failure contract as [`remove_peer`].
pub(crate) async fn ban_peer(
    directory: &PeerDirectory,
    stats: &TransportStats,
    ip: &str,
    port: u16,
    seconds: u64,
    reason: impl std::fmt::Display,
) {
    let peer = format!("{}:{}", ip, port);
    info!(peer = %peer, seconds, %reason, "Banning peer");
    match directory
        .set_state(ip, port, crate::peers::PeerState::Banned, Some(seconds))
        .await
    {
        Ok(()) => TransportStats::bump(&stats.banned),
        Err(e) => debug!(peer = %peer, error = %e, "peer ban failed"),
    }
}
