//! Inbound Peer API
//!
//! The `/peer` HTTP surface. Every request passes a framing middleware
//! that synthesizes the remote peer from the connection and the header
//! bag, validates the header contract, and mutates the directory before
//! the route handler runs. Responses echo our own identity headers so
//! the remote can frame us symmetrically.

use super::dedup::MessageDedup;
use super::hashsum::hashsum;
use super::headers::{validate, NodeHeaders, RawHeaders};
use super::{ban_peer, remove_peer, FailureCode, TransportStats, PROTOCOL_BAN_SECS};
use crate::config::SystemInfo;
use crate::context::{AppContext, NodeEvent};
use crate::peers::directory::MAX_LIST;
use crate::peers::{inspect, PeerDirectory, PeerState, PeerUpdate, RawPeer};

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Blocks returned per `/peer/blocks` request
pub const BLOCKS_PER_REQUEST: u32 = 1440;

/// Request body cap
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Shared state behind the peer API.
pub struct PeerApi {
    pub directory: Arc<PeerDirectory>,
    pub ctx: AppContext,
    pub system: SystemInfo,
    pub node_headers: NodeHeaders,
    pub dedup: Mutex<MessageDedup>,
    pub loaded: Arc<AtomicBool>,
    pub stats: Arc<TransportStats>,
}

impl PeerApi {
    pub fn new(
        system: SystemInfo,
        directory: Arc<PeerDirectory>,
        ctx: AppContext,
        loaded: Arc<AtomicBool>,
        stats: Arc<TransportStats>,
    ) -> Arc<Self> {
        let node_headers = NodeHeaders::from_system(&system);
        Arc::new(Self {
            directory,
            ctx,
            system,
            node_headers,
            dedup: Mutex::new(MessageDedup::default()),
            loaded,
            stats,
        })
    }
}

/// The peer synthesized by the framing middleware, for handlers that
/// punish protocol violations.
#[derive(Debug, Clone)]
pub struct FramedPeer {
    pub ip: String,
    pub port: u16,
}

/// Build the peer-protocol router. It owns the whole peer listener, so
/// routes carry the `/peer` prefix directly and anything else lands in
/// the fallback.
pub fn peer_router(state: Arc<PeerApi>) -> Router {
    Router::new()
        .route("/peer/list", get(list))
        .route("/peer/blocks/common", get(blocks_common))
        .route("/peer/blocks", get(blocks_get).post(blocks_post))
        .route("/peer/signatures", get(signatures_get).post(signatures_post))
        .route("/peer/transactions", get(transactions_get).post(transactions_post))
        .route("/peer/height", get(height))
        .route("/peer/dapp/message", post(dapp_message))
        .route("/peer/dapp/request", post(dapp_request))
        .fallback(unknown_endpoint)
        .layer(middleware::from_fn_with_state(state.clone(), framing))
        .layer(middleware::from_fn_with_state(state.clone(), stamp_identity))
        .with_state(state)
}

/// Echo our identity headers on every `/peer` response.
async fn stamp_identity(
    State(state): State<Arc<PeerApi>>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    for (name, value) in state.node_headers.pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Framing middleware; see module docs.
async fn framing(State(state): State<Arc<PeerApi>>, request: Request, next: Next) -> Response {
    if !state.loaded.load(Ordering::SeqCst) {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Blockchain is loading");
    }
    TransportStats::bump(&state.stats.framed);

    let ip = client_ip(&request);
    let raw = RawHeaders::collect(|name| header_value(request.headers(), name))
        .with_ip(ip.clone());

    // The peer as framed, before validation; used for punishment when
    // the contract is violated.
    let synthesized = inspect(&RawPeer {
        ip: ip.clone(),
        port: raw.port.as_deref().and_then(|p| p.trim().parse().ok()),
        ..Default::default()
    });

    let headers = match validate(&raw) {
        Ok(headers) => headers,
        Err(message) => {
            if let Some(peer_ip) = &synthesized.ip {
                remove_peer(
                    &state.directory,
                    &state.stats,
                    peer_ip,
                    synthesized.port,
                    FailureCode::Headers,
                )
                .await;
            }
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &message);
        }
    };

    let peer_ip = match synthesized.ip {
        Some(peer_ip) => peer_ip,
        // Unreachable past validation, which requires the ip.
        None => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Unknown peer address"),
    };

    if headers.nethash != state.system.nethash {
        remove_peer(&state.directory, &state.stats, &peer_ip, headers.port, FailureCode::Nethash)
            .await;
        return Json(json!({
            "success": false,
            "message": "Request is made on the wrong network",
            "expected": state.system.nethash,
            "received": headers.nethash,
        }))
        .into_response();
    }

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Invalid request body"),
    };

    let parsed: Option<Value> =
        if bytes.is_empty() { None } else { serde_json::from_slice(&bytes).ok() };
    let dappid = parsed
        .as_ref()
        .and_then(|body| body.get("dappid"))
        .and_then(|id| id.as_str())
        .map(str::to_string);

    if headers.version == state.system.version {
        // First contact from a live same-version network: allow forging.
        if state.ctx.chain.last_receipt().is_none() {
            state.ctx.forging.enable_forging();
        }
        state.directory.enqueue_update(PeerUpdate {
            ip: Some(peer_ip.clone()),
            port: headers.port,
            state: Some(PeerState::Connected),
            os: Some(headers.os.clone()),
            version: Some(headers.version.clone()),
            dappid,
        });
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request
        .extensions_mut()
        .insert(FramedPeer { ip: peer_ip, port: headers.port });
    next.run(request).await
}

async fn list(State(state): State<Arc<PeerApi>>) -> Json<Value> {
    match state.directory.list(MAX_LIST, None).await {
        Ok(peers) => Json(json!({ "success": true, "peers": peers })),
        Err(e) => {
            error!(error = %e, "peer list query failed");
            Json(json!({ "success": false, "error": "Failed to get peers" }))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommonQuery {
    #[serde(default)]
    ids: String,
}

async fn blocks_common(
    State(state): State<Arc<PeerApi>>,
    Query(query): Query<CommonQuery>,
) -> Json<Value> {
    let stripped: String = query.ids.chars().filter(|c| !matches!(c, '"' | '\'')).collect();
    let ids: Vec<String> = stripped
        .split(',')
        .filter(|token| !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()))
        .map(str::to_string)
        .collect();

    if ids.is_empty() {
        return Json(json!({ "success": false, "error": "Invalid block id sequence" }));
    }

    match state.ctx.chain.common_block(&ids).await {
        Ok(common) => Json(json!({ "success": true, "common": common })),
        Err(e) => {
            error!(error = %e, "common block lookup failed");
            Json(json!({ "success": false, "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlocksQuery {
    #[serde(default)]
    last_block_id: Option<String>,
}

async fn blocks_get(
    State(state): State<Arc<PeerApi>>,
    Query(query): Query<BlocksQuery>,
) -> Json<Value> {
    match state
        .ctx
        .chain
        .blocks_after(query.last_block_id.as_deref(), BLOCKS_PER_REQUEST)
        .await
    {
        Ok(blocks) => Json(json!({ "blocks": blocks })),
        Err(e) => {
            debug!(error = %e, "block load failed");
            Json(json!({ "blocks": [] }))
        }
    }
}

async fn blocks_post(
    State(state): State<Arc<PeerApi>>,
    Extension(peer): Extension<FramedPeer>,
    bytes: Bytes,
) -> Json<Value> {
    let body = parse_body(&bytes);
    let block = body.get("block").cloned().unwrap_or(Value::Null);

    match state.ctx.chain.normalize_block(block) {
        Err(e) => {
            ban_peer(
                &state.directory,
                &state.stats,
                &peer.ip,
                peer.port,
                PROTOCOL_BAN_SECS,
                FailureCode::Block,
            )
            .await;
            Json(json!({ "success": false, "error": e.to_string() }))
        }
        Ok(block) => {
            state.ctx.publish(NodeEvent::BlockReceived { block: block.raw });
            Json(json!({ "success": true, "blockId": block.id }))
        }
    }
}

async fn signatures_get(State(state): State<Arc<PeerApi>>) -> Json<Value> {
    let signatures: Vec<Value> = state
        .ctx
        .transactions
        .unconfirmed_list()
        .iter()
        .filter_map(|tx| {
            let signatures = tx.get("signatures")?.as_array()?;
            if signatures.is_empty() {
                return None;
            }
            Some(json!({ "transaction": tx.get("id"), "signatures": signatures }))
        })
        .collect();

    Json(json!({ "success": true, "signatures": signatures }))
}

async fn signatures_post(State(state): State<Arc<PeerApi>>, bytes: Bytes) -> Json<Value> {
    let body = parse_body(&bytes);
    let signature = body.get("signature").cloned().unwrap_or(Value::Null);

    if !valid_signature_shape(&signature) {
        return Json(json!({ "success": false, "error": "Signature validation failed" }));
    }

    match state.ctx.signatures.process_signature(signature).await {
        Ok(()) => Json(json!({ "success": true })),
        Err(e) => {
            debug!(error = %e, "signature processing failed");
            Json(json!({ "success": false, "error": "Error processing signature" }))
        }
    }
}

fn valid_signature_shape(signature: &Value) -> bool {
    let Some(map) = signature.as_object() else {
        return false;
    };
    let transaction_ok = map
        .get("transaction")
        .and_then(|t| t.as_str())
        .is_some_and(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()));
    let signature_ok = map
        .get("signature")
        .and_then(|s| s.as_str())
        .is_some_and(|s| s.len() == 128 && s.bytes().all(|b| b.is_ascii_hexdigit()));
    transaction_ok && signature_ok
}

async fn transactions_get(State(state): State<Arc<PeerApi>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "transactions": state.ctx.transactions.unconfirmed_list(),
    }))
}

async fn transactions_post(
    State(state): State<Arc<PeerApi>>,
    Extension(peer): Extension<FramedPeer>,
    bytes: Bytes,
) -> Json<Value> {
    let body = parse_body(&bytes);
    let transaction = body.get("transaction").cloned().unwrap_or(Value::Null);

    let normalized = match state.ctx.transactions.normalize_transaction(transaction) {
        Ok(normalized) => normalized,
        Err(e) => {
            debug!(error = %e, "transaction normalization failed");
            ban_peer(
                &state.directory,
                &state.stats,
                &peer.ip,
                peer.port,
                PROTOCOL_BAN_SECS,
                FailureCode::Transaction,
            )
            .await;
            return Json(json!({ "success": false, "message": "Invalid transaction body" }));
        }
    };

    let id = normalized.id.clone();
    let pool = Arc::clone(&state.ctx.transactions);
    let outcome = state
        .ctx
        .balances_sequence
        .run(async move { pool.receive_transactions(vec![normalized]).await })
        .await;

    match outcome {
        Ok(Ok(())) => Json(json!({ "success": true, "transactionId": id })),
        Ok(Err(e)) => Json(json!({ "success": false, "message": e.to_string() })),
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
    }
}

async fn height(State(state): State<Arc<PeerApi>>) -> Json<Value> {
    Json(json!({ "success": true, "height": state.ctx.chain.height() }))
}

async fn dapp_message(State(state): State<Arc<PeerApi>>, bytes: Bytes) -> Response {
    let body = parse_body(&bytes);

    if let Err(message) = require_dapp_fields(&body) {
        return Json(json!({ "success": false, "message": message })).into_response();
    }

    let hash = body["hash"].as_str().unwrap_or_default().to_string();
    let sum = hashsum(
        body.get("body").unwrap_or(&Value::Null),
        body.get("timestamp").and_then(|t| t.as_i64()),
    );
    if hash != sum {
        return Json(json!({ "success": false, "message": "Invalid hash sum" })).into_response();
    }

    // Already relayed within the gossip horizon.
    if !state.dedup.lock().insert(&hash) {
        return StatusCode::OK.into_response();
    }

    let dappid = body["dappid"].as_str().unwrap_or_default().to_string();
    match state.ctx.dapps.message(&dappid, body.clone()).await {
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })).into_response(),
        Ok(response) => {
            state.ctx.publish(NodeEvent::DappMessageReceived { message: body });
            Json(merge_success(response)).into_response()
        }
    }
}

async fn dapp_request(State(state): State<Arc<PeerApi>>, bytes: Bytes) -> Json<Value> {
    let body = parse_body(&bytes);

    if let Err(message) = require_dapp_fields(&body) {
        return Json(json!({ "success": false, "message": message }));
    }

    let hash = body["hash"].as_str().unwrap_or_default();
    let sum = hashsum(
        body.get("body").unwrap_or(&Value::Null),
        body.get("timestamp").and_then(|t| t.as_i64()),
    );
    if hash != sum {
        return Json(json!({ "success": false, "message": "Invalid hash sum" }));
    }

    let dappid = body["dappid"].as_str().unwrap_or_default().to_string();
    let method = body["method"].as_str().unwrap_or("get").to_string();
    let path = body["path"].as_str().unwrap_or("/").to_string();
    let query = body.get("query").cloned().unwrap_or(Value::Null);

    match state.ctx.dapps.request(&dappid, &method, &path, query).await {
        Err(e) => Json(json!({ "success": false, "message": e.to_string() })),
        Ok(response) => Json(merge_success(response)),
    }
}

async fn unknown_endpoint() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "API endpoint not found")
}

fn require_dapp_fields(body: &Value) -> Result<(), String> {
    for field in ["dappid", "timestamp", "hash"] {
        if body.get(field).map_or(true, |v| v.is_null()) {
            return Err(format!("Missing required property: {}", field));
        }
    }
    if !body["dappid"].is_string() {
        return Err("Invalid dappid".into());
    }
    if !body["timestamp"].is_number() {
        return Err("Invalid timestamp".into());
    }
    if !body["hash"].is_string() {
        return Err("Invalid hash".into());
    }
    Ok(())
}

fn merge_success(base: Value) -> Value {
    match base {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => json!({ "success": true }),
        other => json!({ "success": true, "response": other }),
    }
}

fn parse_body(bytes: &Bytes) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).unwrap_or(Value::Null)
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = header_value(request.headers(), "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::context::testing::{mock_context, MockWorld};
    use crate::peers::{now_ms, MemoryPeerStore, PeerStore};
    use crate::sequence::Sequence;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct TestServer {
        router: Router,
        state: Arc<PeerApi>,
        store: Arc<MemoryPeerStore>,
        world: MockWorld,
        config: NodeConfig,
    }

    fn test_server() -> TestServer {
        let mut config = NodeConfig::default();
        config.min_version = "0.0.0".into();
        config.peers.list.clear();

        let world = mock_context();
        let store = Arc::new(MemoryPeerStore::new());
        let directory = PeerDirectory::new(
            &config,
            store.clone() as Arc<dyn PeerStore>,
            Sequence::new("db"),
        );

        let state = PeerApi::new(
            SystemInfo::from_config(&config),
            directory,
            world.ctx.clone(),
            Arc::new(AtomicBool::new(true)),
            Arc::new(TransportStats::default()),
        );
        let router = peer_router(state.clone());
        TestServer { router, state, store, world, config }
    }

    fn peer_request(
        server: &TestServer,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(path)
            .header("x-forwarded-for", "7.7.7.7")
            .header("port", "7100")
            .header("os", "linux-x86_64")
            .header("version", server.config.version.clone())
            .header("nethash", server.config.nethash.clone());
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&body).unwrap())
            }
            None => Body::empty(),
        };
        builder.body(body).unwrap()
    }

    async fn send(server: &TestServer, request: HttpRequest<Body>) -> (StatusCode, Bytes) {
        let response = server.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes)
    }

    fn as_json(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn drain(server: &TestServer) {
        server
            .state
            .directory
            .set_state("0.0.0.0", 1, PeerState::Disconnected, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_framing_inserts_connected_peer() {
        let server = test_server();
        let (status, _) = send(&server, peer_request(&server, "GET", "/peer/height", None)).await;
        assert_eq!(status, StatusCode::OK);

        drain(&server).await;
        let row = server.store.get("7.7.7.7", 7100).unwrap().unwrap();
        assert_eq!(row.state, PeerState::Connected);
        assert_eq!(row.version, server.config.version);
    }

    #[tokio::test]
    async fn test_framing_signals_forging_before_first_block() {
        let server = test_server();
        send(&server, peer_request(&server, "GET", "/peer/height", None)).await;
        assert!(server.world.forging.enabled.load(Ordering::SeqCst) >= 1);

        // Once a block has been received, no further signals.
        let before = server.world.forging.enabled.load(Ordering::SeqCst);
        *server.world.chain.last_receipt.lock() = Some(now_ms());
        send(&server, peer_request(&server, "GET", "/peer/height", None)).await;
        assert_eq!(server.world.forging.enabled.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_framing_attaches_dappid_from_body() {
        let server = test_server();
        let inner = json!({ "text": "hi" });
        let message = json!({
            "dappid": "16595324874141671114",
            "timestamp": 5,
            "hash": hashsum(&inner, Some(5)),
            "body": inner,
        });
        send(&server, peer_request(&server, "POST", "/peer/dapp/message", Some(message))).await;

        drain(&server).await;
        let linked = server
            .state
            .directory
            .list(100, Some("16595324874141671114"))
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].ip, "7.7.7.7");
    }

    #[tokio::test]
    async fn test_blocks_get_shape() {
        let server = test_server();
        let (_, bytes) = send(
            &server,
            peer_request(&server, "GET", "/peer/blocks?lastBlockId=123", None),
        )
        .await;
        let body = as_json(&bytes);
        assert!(body["blocks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nethash_mismatch_removes_peer() {
        let server = test_server();

        // Known beforehand, so the removal is observable.
        server.store
            .put(crate::peers::Peer {
                ip: "7.7.7.7".into(),
                port: 7100,
                state: PeerState::Connected,
                os: "unknown".into(),
                version: server.config.version.clone(),
                clock: None,
            })
            .unwrap();

        let mut request = peer_request(&server, "GET", "/peer/list", None);
        // A well-formed nethash that is not ours.
        let bogus = "ee".repeat(32);
        request.headers_mut().insert("nethash", HeaderValue::from_str(&bogus).unwrap());

        let (status, bytes) = send(&server, request).await;
        assert_eq!(status, StatusCode::OK);

        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["message"], json!("Request is made on the wrong network"));
        assert_eq!(body["expected"], json!(server.config.nethash));
        assert_eq!(body["received"], json!(bogus));

        assert!(server.store.get("7.7.7.7", 7100).unwrap().is_none());
        assert_eq!(TransportStats::read(&server.state.stats.removed), 1);
    }

    #[tokio::test]
    async fn test_missing_headers_remove_peer_with_500() {
        let server = test_server();
        server.store
            .put(crate::peers::Peer {
                ip: "7.7.7.7".into(),
                port: 0,
                state: PeerState::Disconnected,
                os: "unknown".into(),
                version: "0.0.0".into(),
                clock: None,
            })
            .unwrap();

        let mut request = peer_request(&server, "GET", "/peer/list", None);
        request.headers_mut().remove("port");

        let (status, bytes) = send(&server, request).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let body = as_json(&bytes);
        assert_eq!(body["error"], json!("Missing required property: port"));
        // The synthesized peer has port 0 and was removed.
        assert!(server.store.get("7.7.7.7", 0).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_responses_echo_identity_headers() {
        let server = test_server();
        let response = server
            .router
            .clone()
            .oneshot(peer_request(&server, "GET", "/peer/height", None))
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(
            headers.get("nethash").and_then(|v| v.to_str().ok()),
            Some(server.config.nethash.as_str())
        );
        assert_eq!(headers.get("port").and_then(|v| v.to_str().ok()), Some("7000"));
        assert!(headers.get("version").is_some());
        assert!(headers.get("os").is_some());
    }

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let server = test_server();
        let (status, bytes) =
            send(&server, peer_request(&server, "GET", "/peer/bogus", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(as_json(&bytes)["error"], json!("API endpoint not found"));
    }

    #[tokio::test]
    async fn test_loading_short_circuit() {
        let server = test_server();
        server.state.loaded.store(false, Ordering::SeqCst);

        let (status, bytes) =
            send(&server, peer_request(&server, "GET", "/peer/height", None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(as_json(&bytes)["error"], json!("Blockchain is loading"));
    }

    #[tokio::test]
    async fn test_height_and_list() {
        let server = test_server();
        server.world.chain.height.store(1234, Ordering::SeqCst);

        let (_, bytes) = send(&server, peer_request(&server, "GET", "/peer/height", None)).await;
        assert_eq!(as_json(&bytes)["height"], json!(1234));

        let (_, bytes) = send(&server, peer_request(&server, "GET", "/peer/list", None)).await;
        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(true));
        assert!(body["peers"].is_array());
    }

    #[tokio::test]
    async fn test_blocks_common_sanitizes_ids() {
        let server = test_server();

        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "GET",
                "/peer/blocks/common?ids=%22123%22,abc,456",
                None,
            ),
        )
        .await;
        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(true));
        // The mock echoes the first id back.
        assert_eq!(body["common"]["id"], json!("123"));

        let (_, bytes) = send(
            &server,
            peer_request(&server, "GET", "/peer/blocks/common?ids=abc,def", None),
        )
        .await;
        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Invalid block id sequence"));
    }

    #[tokio::test]
    async fn test_post_block_accepts_and_publishes() {
        let server = test_server();
        let mut bus = server.state.ctx.subscribe();

        let block = json!({ "id": "8999939248621445631", "height": 42 });
        let (_, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/blocks", Some(json!({ "block": block }))),
        )
        .await;

        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["blockId"], json!("8999939248621445631"));

        match bus.try_recv() {
            Ok(NodeEvent::BlockReceived { block }) => {
                assert_eq!(block["height"], json!(42));
            }
            other => panic!("expected BlockReceived, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_invalid_block_bans_for_an_hour() {
        let server = test_server();
        server.world.chain.reject_blocks.store(true, Ordering::SeqCst);

        let before = now_ms();
        let (_, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/blocks", Some(json!({ "block": {} }))),
        )
        .await;
        assert_eq!(as_json(&bytes)["success"], json!(false));

        drain(&server).await;
        let row = server.store.get("7.7.7.7", 7100).unwrap().unwrap();
        assert_eq!(row.state, PeerState::Banned);
        let clock = row.clock.unwrap();
        assert!(clock >= before + PROTOCOL_BAN_SECS * 1000);
        assert!(clock <= now_ms() + PROTOCOL_BAN_SECS * 1000 + 1000);
    }

    #[tokio::test]
    async fn test_post_transaction_roundtrip() {
        let server = test_server();

        let tx = json!({ "id": "7448495233954236537", "amount": 100 });
        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "POST",
                "/peer/transactions",
                Some(json!({ "transaction": tx })),
            ),
        )
        .await;

        let body = as_json(&bytes);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["transactionId"], json!("7448495233954236537"));
        assert_eq!(server.world.pool.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_post_invalid_transaction_bans() {
        let server = test_server();
        server.world.pool.reject.store(true, Ordering::SeqCst);

        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "POST",
                "/peer/transactions",
                Some(json!({ "transaction": {} })),
            ),
        )
        .await;
        assert_eq!(as_json(&bytes)["message"], json!("Invalid transaction body"));

        drain(&server).await;
        let row = server.store.get("7.7.7.7", 7100).unwrap().unwrap();
        assert_eq!(row.state, PeerState::Banned);
    }

    #[tokio::test]
    async fn test_signatures_roundtrip() {
        let server = test_server();

        // Gathered from the unconfirmed list.
        server.world.pool.unconfirmed.lock().push(json!({
            "id": "111",
            "signatures": ["ab".repeat(64)],
        }));
        server.world.pool.unconfirmed.lock().push(json!({ "id": "222" }));

        let (_, bytes) =
            send(&server, peer_request(&server, "GET", "/peer/signatures", None)).await;
        let body = as_json(&bytes);
        assert_eq!(body["signatures"].as_array().unwrap().len(), 1);
        assert_eq!(body["signatures"][0]["transaction"], json!("111"));

        // Valid post is processed.
        let signature = json!({ "transaction": "111", "signature": "ab".repeat(64) });
        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "POST",
                "/peer/signatures",
                Some(json!({ "signature": signature })),
            ),
        )
        .await;
        assert_eq!(as_json(&bytes)["success"], json!(true));
        assert_eq!(server.world.signatures.processed.lock().len(), 1);

        // Malformed post is rejected before the processor runs.
        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "POST",
                "/peer/signatures",
                Some(json!({ "signature": { "transaction": "x" } })),
            ),
        )
        .await;
        assert_eq!(as_json(&bytes)["error"], json!("Signature validation failed"));
        assert_eq!(server.world.signatures.processed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dapp_message_hash_check_and_dedup() {
        let server = test_server();

        let inner = json!({ "type": "chat", "text": "hi" });
        let message = json!({
            "dappid": "16595324874141671114",
            "timestamp": 1000,
            "hash": hashsum(&inner, Some(1000)),
            "body": inner,
        });

        // First delivery reaches the dapp and the bus.
        let mut bus = server.state.ctx.subscribe();
        let (status, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/dapp/message", Some(message.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&bytes)["success"], json!(true));
        assert_eq!(server.world.dapps.messages.lock().len(), 1);
        assert!(matches!(bus.try_recv(), Ok(NodeEvent::DappMessageReceived { .. })));

        // Duplicate: bare 200, no body, dapp untouched.
        let (status, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/dapp/message", Some(message.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(bytes.is_empty());
        assert_eq!(server.world.dapps.messages.lock().len(), 1);

        // Wrong hash is rejected outright.
        let mut tampered = message;
        tampered["hash"] = json!("123456789");
        let (_, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/dapp/message", Some(tampered)),
        )
        .await;
        assert_eq!(as_json(&bytes)["message"], json!("Invalid hash sum"));
        assert_eq!(server.world.dapps.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dapp_message_requires_fields() {
        let server = test_server();
        let (_, bytes) = send(
            &server,
            peer_request(
                &server,
                "POST",
                "/peer/dapp/message",
                Some(json!({ "timestamp": 1, "hash": "2" })),
            ),
        )
        .await;
        assert_eq!(
            as_json(&bytes)["message"],
            json!("Missing required property: dappid")
        );
    }

    #[tokio::test]
    async fn test_dapp_request_forwards() {
        let server = test_server();

        let inner = json!({ "q": 1 });
        let request_body = json!({
            "dappid": "16595324874141671114",
            "timestamp": 7,
            "hash": hashsum(&inner, Some(7)),
            "body": inner,
            "method": "get",
            "path": "/api/items",
            "query": { "q": 1 },
        });

        let (_, bytes) = send(
            &server,
            peer_request(&server, "POST", "/peer/dapp/request", Some(request_body)),
        )
        .await;
        assert_eq!(as_json(&bytes)["success"], json!(true));

        let calls = server.world.dapps.requests.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, "/api/items");
    }
}
