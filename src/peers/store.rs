//! Peer Storage Backend
//!
//! Abstract interface over the two durable peer tables: the peer rows
//! keyed by `(ip, port)` and the peer-dapp associations. The in-memory
//! implementation backs tests and standalone nodes; a relational backend
//! plugs in behind the same trait.

use super::peer::{Peer, PeerState};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid sort field: {0}")]
    InvalidSortField(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sortable columns exposed to callers. Fixed allow-list; anything else
/// is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Ip,
    Port,
    State,
    Os,
    Version,
}

impl SortField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "ip" => Some(SortField::Ip),
            "port" => Some(SortField::Port),
            "state" => Some(SortField::State),
            "os" => Some(SortField::Os),
            "version" => Some(SortField::Version),
            _ => None,
        }
    }
}

/// Parsed `field:direction` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub field: SortField,
    pub descending: bool,
}

impl OrderBy {
    /// Parse `"port"`, `"port:asc"` or `"port:desc"`.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let (name, direction) = match raw.split_once(':') {
            Some((name, direction)) => (name, direction),
            None => (raw, "asc"),
        };

        let field = SortField::parse(name)
            .ok_or_else(|| StoreError::InvalidSortField(name.to_string()))?;

        Ok(Self {
            field,
            descending: direction.eq_ignore_ascii_case("desc"),
        })
    }
}

/// Row selection criteria. Every field is optional; unset fields do not
/// constrain the result.
#[derive(Debug, Clone, Default)]
pub struct FilterQuery {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub state: Option<PeerState>,
    pub os: Option<String>,
    pub version: Option<String>,
    /// Restrict to peers associated with this dapp.
    pub dappid: Option<String>,
    /// Skip banned peers regardless of the `state` criterion.
    pub exclude_banned: bool,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Durable peer table capability.
pub trait PeerStore: Send + Sync {
    /// Look up a row by primary key.
    fn get(&self, ip: &str, port: u16) -> StoreResult<Option<Peer>>;

    /// Insert or replace a row.
    fn put(&self, peer: Peer) -> StoreResult<()>;

    /// Delete a row and its dapp associations. Returns whether a row
    /// existed.
    fn delete(&self, ip: &str, port: u16) -> StoreResult<bool>;

    /// Number of stored rows.
    fn count(&self) -> StoreResult<usize>;

    /// Select rows matching the query.
    fn select(&self, query: &FilterQuery) -> StoreResult<Vec<Peer>>;

    /// Associate a peer with a dapp, idempotently. Returns false when the
    /// peer is unknown.
    fn add_dapp(&self, ip: &str, port: u16, dappid: &str) -> StoreResult<bool>;

    /// Lift every ban whose clock has passed: state back to disconnected,
    /// clock cleared. Returns the number of rows touched.
    fn expire_bans(&self, now_ms: u64) -> StoreResult<usize>;
}

type PeerKey = (String, u16);

/// In-memory peer store.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    rows: RwLock<BTreeMap<PeerKey, Peer>>,
    dapp_links: RwLock<BTreeSet<(PeerKey, String)>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(query: &FilterQuery, peer: &Peer, links: &BTreeSet<(PeerKey, String)>) -> bool {
        if query.exclude_banned && peer.state == PeerState::Banned {
            return false;
        }
        if query.ip.as_deref().is_some_and(|ip| ip != peer.ip) {
            return false;
        }
        if query.port.is_some_and(|port| port != peer.port) {
            return false;
        }
        if query.state.is_some_and(|state| state != peer.state) {
            return false;
        }
        if query.os.as_deref().is_some_and(|os| os != peer.os) {
            return false;
        }
        if query.version.as_deref().is_some_and(|v| v != peer.version) {
            return false;
        }
        if let Some(dappid) = &query.dappid {
            let key = (peer.ip.clone(), peer.port);
            if !links.contains(&(key, dappid.clone())) {
                return false;
            }
        }
        true
    }

    fn sort(rows: &mut [Peer], order: OrderBy) {
        rows.sort_by(|a, b| {
            let ordering = match order.field {
                SortField::Ip => a.ip.cmp(&b.ip),
                SortField::Port => a.port.cmp(&b.port),
                SortField::State => a.state.as_u8().cmp(&b.state.as_u8()),
                SortField::Os => a.os.cmp(&b.os),
                SortField::Version => a.version.cmp(&b.version),
            };
            let ordering = if order.descending { ordering.reverse() } else { ordering };
            // Key order as tiebreaker keeps paging stable.
            ordering.then_with(|| (&a.ip, a.port).cmp(&(&b.ip, b.port)))
        });
    }
}

impl PeerStore for MemoryPeerStore {
    fn get(&self, ip: &str, port: u16) -> StoreResult<Option<Peer>> {
        Ok(self.rows.read().get(&(ip.to_string(), port)).cloned())
    }

    fn put(&self, peer: Peer) -> StoreResult<()> {
        let key = (peer.ip.clone(), peer.port);
        self.rows.write().insert(key, peer);
        Ok(())
    }

    fn delete(&self, ip: &str, port: u16) -> StoreResult<bool> {
        let key = (ip.to_string(), port);
        let existed = self.rows.write().remove(&key).is_some();
        if existed {
            self.dapp_links.write().retain(|(peer, _)| peer != &key);
        }
        Ok(existed)
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.rows.read().len())
    }

    fn select(&self, query: &FilterQuery) -> StoreResult<Vec<Peer>> {
        let links = self.dapp_links.read();
        let mut rows: Vec<Peer> = self
            .rows
            .read()
            .values()
            .filter(|peer| Self::matches(query, peer, &links))
            .cloned()
            .collect();

        if let Some(order) = query.order_by {
            Self::sort(&mut rows, order);
        }

        let rows = rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(rows)
    }

    fn add_dapp(&self, ip: &str, port: u16, dappid: &str) -> StoreResult<bool> {
        let key = (ip.to_string(), port);
        if !self.rows.read().contains_key(&key) {
            return Ok(false);
        }
        self.dapp_links.write().insert((key, dappid.to_string()));
        Ok(true)
    }

    fn expire_bans(&self, now_ms: u64) -> StoreResult<usize> {
        let mut touched = 0;
        for peer in self.rows.write().values_mut() {
            if peer.state == PeerState::Banned && peer.clock.is_some_and(|clock| clock <= now_ms) {
                peer.state = PeerState::Disconnected;
                peer.clock = None;
                touched += 1;
            }
        }
        Ok(touched)
    }
}
