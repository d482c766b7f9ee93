//! Management API
//!
//! Public read-only endpoints under `/api/peers`: filtered directory
//! queries, single-peer lookup and the node version. Schema problems
//! surface the first failure message with a 500, protocol-style.

use crate::config::SystemInfo;
use crate::peers::directory::PeerFilterParams;
use crate::peers::PeerDirectory;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

/// Shared state behind the management API.
pub struct ManagementApi {
    pub directory: Arc<PeerDirectory>,
    pub system: SystemInfo,
}

/// Build the `/api/peers` router.
pub fn api_router(directory: Arc<PeerDirectory>, system: SystemInfo) -> Router {
    let state = Arc::new(ManagementApi { directory, system });
    Router::new()
        .route("/api/peers", get(peers_index))
        .route("/api/peers/get", get(peers_get))
        .route("/api/peers/version", get(peers_version))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexQuery {
    ip: Option<String>,
    port: Option<i64>,
    state: Option<i64>,
    os: Option<String>,
    version: Option<String>,
    order_by: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn peers_index(
    State(state): State<Arc<ManagementApi>>,
    Query(query): Query<IndexQuery>,
) -> Response {
    let port = match query.port {
        None => None,
        Some(port) => match u16::try_from(port) {
            Ok(port) if port >= 1 => Some(port),
            _ => return schema_error(format!("Invalid port: {}", port)),
        },
    };

    let peer_state = match query.state {
        None => None,
        Some(value) => match u8::try_from(value) {
            Ok(value) if value <= 2 => Some(value),
            _ => return schema_error(format!("Invalid state: {}", value)),
        },
    };

    let params = PeerFilterParams {
        ip: query.ip,
        port,
        state: peer_state,
        os: query.os,
        version: query.version,
        order_by: query.order_by,
        limit: query.limit,
        offset: query.offset,
    };

    match state.directory.get_by_filter(&params) {
        Ok(peers) => Json(json!({ "success": true, "peers": peers })).into_response(),
        Err(e) => schema_error(e.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct GetQuery {
    ip: Option<String>,
    port: Option<u16>,
}

async fn peers_get(
    State(state): State<Arc<ManagementApi>>,
    Query(query): Query<GetQuery>,
) -> Response {
    let Some(ip) = query.ip else {
        return schema_error("Missing required property: ip".into());
    };
    let Some(port) = query.port else {
        return schema_error("Missing required property: port".into());
    };

    match state.directory.get(&ip, port).await {
        Ok(Some(peer)) => Json(json!({ "success": true, "peer": peer })).into_response(),
        Ok(None) => {
            Json(json!({ "success": false, "error": "Peer not found" })).into_response()
        }
        Err(e) => {
            error!(error = %e, "peer lookup failed");
            schema_error("Failed to get peer".into())
        }
    }
}

async fn peers_version(State(state): State<Arc<ManagementApi>>) -> Json<Value> {
    Json(json!({
        "success": true,
        "version": state.system.version,
        "build": state.system.build,
    }))
}

fn schema_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}
