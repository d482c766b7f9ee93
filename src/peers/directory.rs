//! Peer Directory
//!
//! Operations over the durable peer table, the peer-exchange refresh
//! cycle, seed bootstrap and the ban manager. Every mutation is
//! serialized through the db sequence; callers that must not block
//! enqueue and continue.

use super::peer::{inspect, version_lt, Peer, PeerState, PeerUpdate, RawPeer};
use super::removed::RemovedCache;
use super::store::{FilterQuery, OrderBy, PeerStore};
use super::{now_ms, DirectoryError, DirectoryResult, PeerExchange};
use crate::config::{NodeConfig, SeedPeer};
use crate::sequence::Sequence;

use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Refresh loop cadence
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Ban manager cadence
pub const BAN_INTERVAL: Duration = Duration::from_secs(65);

/// Hard cap on rows returned by `list` and `get_by_filter`
pub const MAX_LIST: usize = 100;

/// Candidate validations in flight during a refresh cycle
const REFRESH_CONCURRENCY: usize = 2;

/// Directory counters surfaced by the management API.
#[derive(Debug, Clone, Default)]
pub struct DirectoryStats {
    pub known: usize,
    pub connected: usize,
    pub banned: usize,
    pub removed_cached: usize,
}

/// Raw `get_by_filter` input, as received by the management API.
#[derive(Debug, Clone, Default)]
pub struct PeerFilterParams {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub state: Option<u8>,
    pub os: Option<String>,
    pub version: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Durable, queryable directory of known peers.
pub struct PeerDirectory {
    store: Arc<dyn PeerStore>,
    seeds: Vec<SeedPeer>,
    min_version: String,
    max_update_peers: usize,
    db_sequence: Arc<Sequence>,
    removed: Arc<Mutex<RemovedCache>>,
    exchange: RwLock<Option<Arc<dyn PeerExchange>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    ready_signaled: AtomicBool,
}

impl PeerDirectory {
    pub fn new(
        config: &NodeConfig,
        store: Arc<dyn PeerStore>,
        db_sequence: Arc<Sequence>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);

        Arc::new(Self {
            store,
            seeds: config.peers.list.clone(),
            min_version: config.min_version.clone(),
            max_update_peers: config.peers.options.max_update_peers,
            db_sequence,
            removed: Arc::new(Mutex::new(RemovedCache::default())),
            exchange: RwLock::new(None),
            ready_tx,
            ready_rx,
            ready_signaled: AtomicBool::new(false),
        })
    }

    /// Late-bind the peer-exchange capability. Called once the transport
    /// client exists; refresh cycles before that are no-ops.
    pub fn bind_exchange(&self, exchange: Arc<dyn PeerExchange>) {
        *self.exchange.write() = Some(exchange);
    }

    /// Observe the peers-ready signal.
    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_signaled.load(Ordering::SeqCst)
    }

    fn signal_ready(&self) {
        if !self.ready_signaled.swap(true, Ordering::SeqCst) {
            let _ = self.ready_tx.send(true);
        }
    }

    fn is_whitelisted(&self, ip: &str, port: u16) -> bool {
        self.seeds.iter().any(|seed| seed.ip == ip && seed.port == port)
    }

    /// Up to `limit` non-banned peers in randomized order, optionally
    /// restricted to peers associated with a dapp.
    pub async fn list(&self, limit: usize, dappid: Option<&str>) -> DirectoryResult<Vec<Peer>> {
        let query = FilterQuery {
            exclude_banned: true,
            dappid: dappid.map(str::to_string),
            ..Default::default()
        };
        let mut rows = self.store.select(&query)?;
        rows.shuffle(&mut rand::thread_rng());
        rows.truncate(limit.min(MAX_LIST));
        Ok(rows)
    }

    /// Upsert a peer by `(ip, port)`, serialized through the db sequence.
    pub async fn update(&self, update: PeerUpdate) -> DirectoryResult<()> {
        let store = Arc::clone(&self.store);
        let min_version = self.min_version.clone();
        self.db_sequence
            .run(async move { apply_update(store, &min_version, update) })
            .await?
    }

    /// Enqueue an upsert and continue; failures are logged and dropped.
    pub fn enqueue_update(&self, update: PeerUpdate) {
        let store = Arc::clone(&self.store);
        let min_version = self.min_version.clone();
        self.db_sequence.enqueue(async move {
            let label = update.label();
            if let Err(e) = apply_update(store, &min_version, update) {
                debug!(peer = %label, error = %e, "peer update dropped");
            }
        });
    }

    /// Set peer state. Banning arms the ban clock; any other state clears
    /// it. Whitelisted seeds reject.
    pub async fn set_state(
        &self,
        ip: &str,
        port: u16,
        state: PeerState,
        timeout_secs: Option<u64>,
    ) -> DirectoryResult<()> {
        if self.is_whitelisted(ip, port) {
            return Err(DirectoryError::WhiteListed);
        }

        let store = Arc::clone(&self.store);
        let ip = ip.to_string();
        self.db_sequence
            .run(async move {
                let clock = match state {
                    PeerState::Banned => {
                        Some(now_ms() + timeout_secs.unwrap_or(1).max(1) * 1000)
                    }
                    _ => None,
                };
                if let Some(mut row) = store.get(&ip, port)? {
                    row.state = state;
                    row.clock = clock;
                    store.put(row)?;
                }
                Ok::<_, DirectoryError>(())
            })
            .await?
    }

    /// Delete a peer and record its ip in the suppression cache.
    /// Whitelisted seeds reject.
    pub async fn remove(&self, ip: &str, port: u16) -> DirectoryResult<()> {
        if self.is_whitelisted(ip, port) {
            return Err(DirectoryError::WhiteListed);
        }

        let store = Arc::clone(&self.store);
        let removed = Arc::clone(&self.removed);
        let ip = ip.to_string();
        self.db_sequence
            .run(async move {
                store.delete(&ip, port)?;
                removed.lock().push(ip);
                Ok::<_, DirectoryError>(())
            })
            .await?
    }

    /// Associate an existing peer with a dapp.
    pub async fn add_dapp(&self, ip: &str, port: u16, dappid: &str) -> DirectoryResult<()> {
        let store = Arc::clone(&self.store);
        let ip = ip.to_string();
        let dappid = dappid.to_string();
        self.db_sequence
            .run(async move {
                if !store.add_dapp(&ip, port, &dappid)? {
                    debug!(ip = %ip, port, "dapp association for unknown peer skipped");
                }
                Ok::<_, DirectoryError>(())
            })
            .await?
    }

    pub async fn count(&self) -> DirectoryResult<usize> {
        Ok(self.store.count()?)
    }

    /// Single peer by primary key.
    pub async fn get(&self, ip: &str, port: u16) -> DirectoryResult<Option<Peer>> {
        Ok(self.store.get(ip, port)?)
    }

    /// Lift expired bans. Returns the number of peers restored.
    pub async fn ban_manager(&self) -> DirectoryResult<usize> {
        Ok(self.store.expire_bans(now_ms())?)
    }

    /// SQL-backed search for the management API.
    pub fn get_by_filter(&self, params: &PeerFilterParams) -> DirectoryResult<Vec<Peer>> {
        let limit = params.limit.map(|l| l.unsigned_abs() as usize).unwrap_or(MAX_LIST);
        if limit > MAX_LIST {
            return Err(DirectoryError::InvalidFilter(format!(
                "Invalid limit. Maximum is {}",
                MAX_LIST
            )));
        }
        let offset = params.offset.map(|o| o.unsigned_abs() as usize).unwrap_or(0);

        let state = match params.state {
            Some(raw) => Some(PeerState::from_u8(raw).ok_or_else(|| {
                DirectoryError::InvalidFilter(format!("Invalid state: {}", raw))
            })?),
            None => None,
        };

        let order_by = params.order_by.as_deref().map(OrderBy::parse).transpose()?;

        let query = FilterQuery {
            ip: params.ip.clone(),
            port: params.port,
            state,
            os: params.os.clone(),
            version: params.version.clone(),
            dappid: None,
            exclude_banned: false,
            order_by,
            limit: Some(limit),
            offset,
        };
        Ok(self.store.select(&query)?)
    }

    pub fn stats(&self) -> DirectoryResult<DirectoryStats> {
        let rows = self.store.select(&FilterQuery::default())?;
        let connected = rows.iter().filter(|p| p.state == PeerState::Connected).count();
        let banned = rows.iter().filter(|p| p.state == PeerState::Banned).count();
        Ok(DirectoryStats {
            known: rows.len(),
            connected,
            banned,
            removed_cached: self.removed.lock().len(),
        })
    }

    /// Seed bootstrap. Upserts every configured seed as connected, runs
    /// one refresh cycle when the directory is non-empty, and signals
    /// peers-ready exactly once.
    pub async fn on_blockchain_ready(&self) {
        for seed in &self.seeds {
            let update = PeerUpdate {
                ip: Some(seed.ip.clone()),
                port: seed.port,
                state: Some(PeerState::Connected),
                os: None,
                version: None,
                dappid: None,
            };
            if let Err(e) = self.update(update).await {
                warn!(seed = %seed.ip, error = %e, "seed insert failed");
            }
        }

        match self.count().await {
            Ok(0) | Err(_) => {
                warn!("Peers list is empty");
            }
            Ok(count) => {
                if let Err(e) = self.refresh_from_random_peer().await {
                    warn!(error = %e, "initial peer refresh failed");
                }
                info!("Peers ready, stored {}", count);
            }
        }

        self.signal_ready();
    }

    /// Start the two periodic loops. Each reschedules itself and swallows
    /// its own errors; neither blocks the other.
    pub fn spawn_loops(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let refresher = Arc::clone(self);
        let refresh = tokio::spawn(async move {
            loop {
                tokio::time::sleep(REFRESH_INTERVAL).await;
                if let Err(e) = refresher.refresh_from_random_peer().await {
                    warn!(error = %e, "peer refresh cycle failed");
                }
                if let Ok(stats) = refresher.stats() {
                    debug!(
                        known = stats.known,
                        connected = stats.connected,
                        banned = stats.banned,
                        "refresh cycle finished"
                    );
                }
            }
        });

        let banner = Arc::clone(self);
        let bans = tokio::spawn(async move {
            loop {
                tokio::time::sleep(BAN_INTERVAL).await;
                match banner.ban_manager().await {
                    Ok(0) => {}
                    Ok(lifted) => debug!(lifted, "expired bans lifted"),
                    Err(e) => warn!(error = %e, "ban manager cycle failed"),
                }
            }
        });

        vec![refresh, bans]
    }

    /// One peer-exchange round: fetch `/peer/list` from a random live
    /// peer and fold the advertised peers into the directory. Fetch and
    /// shape problems abort the cycle quietly; the next round retries.
    pub async fn refresh_from_random_peer(&self) -> DirectoryResult<()> {
        let exchange = match self.exchange.read().clone() {
            Some(exchange) => exchange,
            None => {
                debug!("peer exchange not bound yet");
                return Ok(());
            }
        };

        let body = match exchange.fetch_peer_list().await {
            Ok(body) => body,
            Err(e) => {
                debug!(error = %e, "peer list fetch failed");
                return Ok(());
            }
        };

        let list = match body.get("peers").and_then(|v| v.as_array()) {
            Some(list) => list,
            None => {
                debug!("malformed peer list response");
                return Ok(());
            }
        };

        let mut raws = Vec::with_capacity(list.len());
        let mut seen = HashSet::new();
        for item in list {
            let raw: RawPeer = match serde_json::from_value(item.clone()) {
                Ok(raw) => raw,
                Err(_) => {
                    debug!("peer list entry is not a peer record");
                    return Ok(());
                }
            };
            if !seen.insert((raw.ip.clone(), raw.port)) {
                debug!("peer list response contains duplicates");
                return Ok(());
            }
            raws.push(raw);
        }

        let candidates: Vec<RawPeer> = {
            let removed = self.removed.lock();
            raws.into_iter()
                .filter(|raw| raw.ip.as_deref().map_or(true, |ip| !removed.contains(ip)))
                .take(self.max_update_peers)
                .collect()
        };

        // Roughly every other cycle, let the oldest and newest removed
        // peers become discoverable again.
        if rand::thread_rng().gen_bool(0.5) {
            self.removed.lock().shrink();
        }

        stream::iter(candidates)
            .map(|raw| self.process_candidate(raw))
            .buffer_unordered(REFRESH_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;

        Ok(())
    }

    async fn process_candidate(&self, raw: RawPeer) {
        let update = inspect(&raw);

        if let Some(version) = &update.version {
            if version_lt(version, &self.min_version) {
                warn!(
                    peer = %update.label(),
                    version = %version,
                    "Rejecting peer (invalid version)"
                );
                return;
            }
        }

        if raw.ip.is_none() || raw.port.map_or(true, |p| p == 0) || raw.state.is_none() {
            debug!(peer = %update.label(), "Rejecting malformed peer record");
            return;
        }

        self.enqueue_update(update);
    }
}

impl std::fmt::Debug for PeerDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDirectory")
            .field("seeds", &self.seeds.len())
            .field("min_version", &self.min_version)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Merge an upsert payload into the stored row. Runs on the db sequence,
/// so read-modify-write is race-free.
fn apply_update(
    store: Arc<dyn PeerStore>,
    min_version: &str,
    update: PeerUpdate,
) -> DirectoryResult<()> {
    let ip = match &update.ip {
        Some(ip) => ip.clone(),
        None => {
            debug!("peer update without ip skipped");
            return Ok(());
        }
    };

    if let Some(version) = &update.version {
        if version_lt(version, min_version) {
            return Err(DirectoryError::InvalidVersion(version.clone()));
        }
    }

    let row = match store.get(&ip, update.port)? {
        Some(mut row) => {
            if let Some(state) = update.state {
                // Bans only happen through set_state, which owns the clock.
                if state != PeerState::Banned {
                    row.state = state;
                    row.clock = None;
                }
            }
            if let Some(os) = update.os {
                row.os = os;
            }
            if let Some(version) = update.version {
                row.version = version;
            }
            row
        }
        None => Peer {
            ip: ip.clone(),
            port: update.port,
            state: match update.state {
                Some(PeerState::Banned) | None => PeerState::Disconnected,
                Some(state) => state,
            },
            os: update.os.unwrap_or_else(|| "unknown".into()),
            version: update.version.unwrap_or_else(|| "0.0.0".into()),
            clock: None,
        },
    };

    store.put(row)?;

    if let Some(dappid) = update.dappid {
        store.add_dapp(&ip, update.port, &dappid)?;
    }

    Ok(())
}
