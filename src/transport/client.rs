//! Outbound Peer RPC
//!
//! HTTP client for the peer protocol. Every response is framed the same
//! way we frame inbound requests: status, header contract, nethash. The
//! failure-code policy mutates the directory as a side effect, so bad
//! peers drain out of rotation without any caller involvement.

use super::headers::{validate, NodeHeaders, RawHeaders};
use super::{
    ban_peer, remove_peer, FailureCode, TransportError, TransportResult, TransportStats,
    TRANSPORT_BAN_SECS,
};
use crate::config::{NodeConfig, SystemInfo};
use crate::peers::{PeerDirectory, PeerExchange, PeerState, PeerUpdate};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Random-peer selection attempts before giving up
pub const RANDOM_PEER_RETRIES: usize = 20;

/// Concurrent requests during a gossip fan-out
pub const BROADCAST_CONCURRENCY: usize = 3;

/// Request target, either a peer-API path or a raw absolute path.
#[derive(Debug, Clone)]
pub enum RequestPath {
    /// Mounted under `/peer`
    Api(String),
    /// Used as-is
    Absolute(String),
}

impl RequestPath {
    fn as_url_path(&self) -> String {
        match self {
            RequestPath::Api(api) => format!("/peer{}", api),
            RequestPath::Absolute(path) => path.clone(),
        }
    }
}

/// An outbound peer request.
#[derive(Debug, Clone)]
pub struct PeerRequest {
    pub method: Method,
    pub path: RequestPath,
    pub body: Option<Value>,
}

impl PeerRequest {
    pub fn get(api: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: RequestPath::Api(api.into()),
            body: None,
        }
    }

    pub fn post(api: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: RequestPath::Api(api.into()),
            body: Some(body),
        }
    }
}

/// A framed peer response.
#[derive(Debug, Clone)]
pub struct PeerResponse {
    pub body: Value,
    pub headers: super::headers::PeerHeaders,
}

/// Outbound peer RPC client.
pub struct PeerClient {
    http: reqwest::Client,
    directory: Arc<PeerDirectory>,
    node_headers: NodeHeaders,
    nethash: String,
    current_version: String,
    loaded: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
}

impl PeerClient {
    pub fn new(
        config: &NodeConfig,
        system: &SystemInfo,
        directory: Arc<PeerDirectory>,
        loaded: Arc<AtomicBool>,
        stats: Arc<TransportStats>,
    ) -> TransportResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.peers.options.timeout_ms))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Arc::new(Self {
            http,
            directory,
            node_headers: NodeHeaders::from_system(system),
            nethash: system.nethash.clone(),
            current_version: system.version.clone(),
            loaded,
            stats,
        }))
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Issue one request to one peer and frame the response. Failures
    /// mutate the directory per the failure-code policy before the error
    /// is returned.
    pub async fn get_from_peer(
        &self,
        ip: &str,
        port: u16,
        request: &PeerRequest,
    ) -> TransportResult<PeerResponse> {
        let url = format!("http://{}:{}{}", ip, port, request.path.as_url_path());

        let mut builder = self.http.request(request.method.clone(), &url);
        for (name, value) in self.node_headers.pairs() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_timeout() {
                    remove_peer(&self.directory, &self.stats, ip, port, FailureCode::Timeout)
                        .await;
                } else if e.is_connect() {
                    remove_peer(&self.directory, &self.stats, ip, port, FailureCode::Unavailable)
                        .await;
                } else {
                    ban_peer(
                        &self.directory,
                        &self.stats,
                        ip,
                        port,
                        TRANSPORT_BAN_SECS,
                        &e,
                    )
                    .await;
                }
                return Err(TransportError::Http(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        if status != 200 {
            remove_peer(&self.directory, &self.stats, ip, port, FailureCode::Response(status))
                .await;
            return Err(TransportError::BadStatus(status));
        }

        let raw = RawHeaders::collect(|name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .with_ip(Some(ip.to_string()));

        let headers = match validate(&raw) {
            Ok(headers) => headers,
            Err(message) => {
                remove_peer(&self.directory, &self.stats, ip, port, FailureCode::Headers).await;
                return Err(TransportError::BadHeaders(message));
            }
        };

        if headers.nethash != self.nethash {
            remove_peer(&self.directory, &self.stats, ip, port, FailureCode::Nethash).await;
            return Err(TransportError::NethashMismatch);
        }

        if headers.version == self.current_version {
            self.directory.enqueue_update(PeerUpdate {
                ip: Some(ip.to_string()),
                port: headers.port,
                state: Some(PeerState::Connected),
                os: Some(headers.os.clone()),
                version: Some(headers.version.clone()),
                dappid: None,
            });
        }

        let body = match response.json::<Value>().await {
            Ok(body) => body,
            Err(e) => {
                ban_peer(&self.directory, &self.stats, ip, port, TRANSPORT_BAN_SECS, &e).await;
                return Err(TransportError::BadBody(e.to_string()));
            }
        };

        Ok(PeerResponse { body, headers })
    }

    /// Issue a request to one random reachable peer, retrying with a
    /// fresh pick on every failure.
    pub async fn get_from_random_peer(
        &self,
        dappid: Option<&str>,
        request: &PeerRequest,
    ) -> TransportResult<PeerResponse> {
        if !self.loaded.load(Ordering::SeqCst) {
            return Err(TransportError::Loading);
        }

        let mut last = TransportError::NoPeers;
        for _ in 0..RANDOM_PEER_RETRIES {
            TransportStats::bump(&self.stats.random_attempts);

            let picked = match self.directory.list(1, dappid).await {
                Ok(peers) => peers.into_iter().next(),
                Err(e) => {
                    last = TransportError::Directory(e);
                    continue;
                }
            };

            let peer = match picked {
                Some(peer) => peer,
                None => {
                    last = TransportError::NoPeers;
                    continue;
                }
            };

            match self.get_from_peer(&peer.ip, peer.port, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(peer = %peer.label(), error = %e, "random peer attempt failed");
                    last = e;
                }
            }
        }

        Err(last)
    }

    /// Fan a request out to up to `limit` peers with bounded concurrency.
    /// Individual failures are already handled by the framing policy and
    /// are otherwise ignored. Returns the number of peers contacted.
    pub async fn broadcast(
        &self,
        limit: usize,
        dappid: Option<&str>,
        request: PeerRequest,
    ) -> usize {
        if !self.loaded.load(Ordering::SeqCst) {
            debug!("broadcast skipped, blockchain is loading");
            return 0;
        }

        let peers = match self.directory.list(limit, dappid).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "broadcast peer selection failed");
                return 0;
            }
        };

        TransportStats::bump(&self.stats.broadcasts);
        let contacted = peers.len();

        stream::iter(peers)
            .map(|peer| {
                let request = &request;
                async move {
                    let _ = self.get_from_peer(&peer.ip, peer.port, request).await;
                }
            })
            .buffer_unordered(BROADCAST_CONCURRENCY)
            .collect::<Vec<()>>()
            .await;

        contacted
    }
}

#[async_trait]
impl PeerExchange for PeerClient {
    async fn fetch_peer_list(&self) -> TransportResult<Value> {
        let response = self
            .get_from_random_peer(None, &PeerRequest::get("/list"))
            .await?;
        Ok(response.body)
    }
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("nethash", &self.nethash)
            .field("version", &self.current_version)
            .finish()
    }
}
