//! Gossip Event Hooks
//!
//! Consumes the node bus and fans new blocks, transactions, signatures
//! and dapp messages out to the network. Fan-out runs on its own task,
//! so event producers never wait on peer HTTP round trips. Socket
//! subscribers get a change notification alongside each broadcast.

use super::client::{PeerClient, PeerRequest};
use super::BROADCAST_LIMIT;
use crate::context::{AppContext, NodeEvent};

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Subscribe to the bus and dispatch gossip until the bus closes.
pub fn spawn_event_hooks(
    client: Arc<PeerClient>,
    ctx: AppContext,
    loaded: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut bus = ctx.subscribe();
    tokio::spawn(async move {
        loop {
            match bus.recv().await {
                Ok(event) => handle_event(&client, &ctx, &loaded, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus lagged, gossip events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn handle_event(
    client: &Arc<PeerClient>,
    ctx: &AppContext,
    loaded: &Arc<AtomicBool>,
    event: NodeEvent,
) {
    if !loaded.load(Ordering::SeqCst) {
        debug!("gossip event dropped, blockchain is loading");
        return;
    }

    match event {
        NodeEvent::NewBlock { block, broadcast: true } => {
            fan_out(client, None, PeerRequest::post("/blocks", json!({ "block": block })));
            ctx.sockets.emit("blocks/change", json!({}));
        }
        NodeEvent::NewTransaction { transaction, broadcast: true } => {
            fan_out(
                client,
                None,
                PeerRequest::post("/transactions", json!({ "transaction": transaction })),
            );
            ctx.sockets.emit("transactions/change", json!({}));
        }
        NodeEvent::NewSignature { signature, broadcast: true } => {
            fan_out(
                client,
                None,
                PeerRequest::post("/signatures", json!({ "signature": signature })),
            );
            ctx.sockets.emit("signature/change", json!({}));
        }
        NodeEvent::DappMessage { message, broadcast: true } => {
            let dappid = message
                .get("dappid")
                .and_then(|id| id.as_str())
                .map(str::to_string);
            fan_out(client, dappid, PeerRequest::post("/dapp/message", message));
        }
        _ => {}
    }
}

/// Launch a broadcast without awaiting its completion.
fn fan_out(client: &Arc<PeerClient>, dappid: Option<String>, request: PeerRequest) {
    let client = Arc::clone(client);
    tokio::spawn(async move {
        let contacted = client
            .broadcast(BROADCAST_LIMIT, dappid.as_deref(), request)
            .await;
        debug!(contacted, "gossip fan-out finished");
    });
}
