//! Collaborator Capabilities
//!
//! The transport and the peer directory talk to the rest of the node
//! through narrow capabilities: the chain, the transaction pool, the
//! multisignature processor, the dapp bridge, forging control and the
//! socket hub. Each trait carries only the methods this subsystem
//! actually calls; concrete implementations live in the owning modules.
//!
//! Domain events travel over the node bus, a broadcast channel every
//! subsystem can subscribe to.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::sequence::Sequence;

/// Opaque collaborator failure, surfaced to protocol peers verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct CollabError(pub String);

impl CollabError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A block accepted by `normalize_block`.
#[derive(Debug, Clone)]
pub struct NormalizedBlock {
    pub id: String,
    pub height: u64,
    pub raw: Value,
}

/// A transaction accepted by `normalize_transaction`.
#[derive(Debug, Clone)]
pub struct NormalizedTransaction {
    pub id: String,
    pub raw: Value,
}

/// A block shared with a remote peer, from `common_block`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommonBlock {
    pub id: String,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_block: Option<String>,
}

/// Chain view: block normalization, lookups and receipt tracking.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Validate and normalize a block received from a peer.
    fn normalize_block(&self, raw: Value) -> Result<NormalizedBlock, CollabError>;

    /// Highest block shared with the given candidate ids, if any.
    async fn common_block(&self, ids: &[String]) -> Result<Option<CommonBlock>, CollabError>;

    /// Up to `limit` full blocks after `last_block_id` (chain start when
    /// absent), oldest first.
    async fn blocks_after(
        &self,
        last_block_id: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Value>, CollabError>;

    /// Current chain height.
    fn height(&self) -> u64;

    /// Timestamp of the last block received from the network, if any.
    fn last_receipt(&self) -> Option<u64>;
}

/// Unconfirmed transaction pool.
#[async_trait]
pub trait TransactionPool: Send + Sync {
    /// Validate and normalize a transaction received from a peer.
    fn normalize_transaction(&self, raw: Value) -> Result<NormalizedTransaction, CollabError>;

    /// Accept transactions into the pool. Callers serialize invocations
    /// through the balances sequence.
    async fn receive_transactions(
        &self,
        txs: Vec<NormalizedTransaction>,
    ) -> Result<(), CollabError>;

    /// Current unconfirmed transaction list.
    fn unconfirmed_list(&self) -> Vec<Value>;
}

/// Multisignature processor.
#[async_trait]
pub trait SignatureProcessor: Send + Sync {
    async fn process_signature(&self, signature: Value) -> Result<(), CollabError>;
}

/// Sandboxed dapp bridge.
#[async_trait]
pub trait DappBridge: Send + Sync {
    /// Deliver a gossip message to a dapp.
    async fn message(&self, dappid: &str, body: Value) -> Result<Value, CollabError>;

    /// Forward a direct request to a dapp and return its response body.
    async fn request(
        &self,
        dappid: &str,
        method: &str,
        path: &str,
        query: Value,
    ) -> Result<Value, CollabError>;
}

/// Forging control, signaled when a same-version peer frames us before
/// any block has been received.
pub trait ForgingControl: Send + Sync {
    fn enable_forging(&self);
}

/// Socket hub for UI subscribers.
pub trait SocketHub: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Domain events on the node bus.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A block arrived over the peer API and passed normalization.
    BlockReceived { block: Value },
    /// A dapp message arrived over the peer API and passed the hash check.
    DappMessageReceived { message: Value },
    /// A locally forged or accepted block to announce.
    NewBlock { block: Value, broadcast: bool },
    /// A new unconfirmed transaction to announce.
    NewTransaction { transaction: Value, broadcast: bool },
    /// A new multisignature to announce.
    NewSignature { signature: Value, broadcast: bool },
    /// A dapp message to relay to dapp-associated peers.
    DappMessage { message: Value, broadcast: bool },
}

/// Shared application context handed to both components at construction.
#[derive(Clone)]
pub struct AppContext {
    pub chain: Arc<dyn ChainClient>,
    pub transactions: Arc<dyn TransactionPool>,
    pub signatures: Arc<dyn SignatureProcessor>,
    pub dapps: Arc<dyn DappBridge>,
    pub forging: Arc<dyn ForgingControl>,
    pub sockets: Arc<dyn SocketHub>,
    pub bus: broadcast::Sender<NodeEvent>,
    pub db_sequence: Arc<Sequence>,
    pub balances_sequence: Arc<Sequence>,
}

impl AppContext {
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.bus.subscribe()
    }

    /// Publish an event; delivery is best-effort when nobody listens.
    pub fn publish(&self, event: NodeEvent) {
        let _ = self.bus.send(event);
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("db_sequence", &self.db_sequence)
            .field("balances_sequence", &self.balances_sequence)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording collaborator doubles shared by the unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MockChain {
        pub height: AtomicU64,
        pub last_receipt: Mutex<Option<u64>>,
        pub reject_blocks: std::sync::atomic::AtomicBool,
        pub normalized: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl ChainClient for MockChain {
        fn normalize_block(&self, raw: Value) -> Result<NormalizedBlock, CollabError> {
            if self.reject_blocks.load(Ordering::SeqCst) {
                return Err(CollabError::new("Failed to validate block schema"));
            }
            let id = raw
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CollabError::new("Missing block id"))?
                .to_string();
            let height = raw.get("height").and_then(|v| v.as_u64()).unwrap_or(0);
            self.normalized.lock().push(raw.clone());
            Ok(NormalizedBlock { id, height, raw })
        }

        async fn common_block(&self, ids: &[String]) -> Result<Option<CommonBlock>, CollabError> {
            Ok(ids.first().map(|id| CommonBlock {
                id: id.clone(),
                height: 1,
                previous_block: None,
            }))
        }

        async fn blocks_after(
            &self,
            _last_block_id: Option<&str>,
            _limit: u32,
        ) -> Result<Vec<Value>, CollabError> {
            Ok(Vec::new())
        }

        fn height(&self) -> u64 {
            self.height.load(Ordering::SeqCst)
        }

        fn last_receipt(&self) -> Option<u64> {
            *self.last_receipt.lock()
        }
    }

    #[derive(Default)]
    pub struct MockPool {
        pub unconfirmed: Mutex<Vec<Value>>,
        pub received: Mutex<Vec<NormalizedTransaction>>,
        pub reject: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TransactionPool for MockPool {
        fn normalize_transaction(
            &self,
            raw: Value,
        ) -> Result<NormalizedTransaction, CollabError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(CollabError::new("Failed to validate transaction schema"));
            }
            let id = raw
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CollabError::new("Missing transaction id"))?
                .to_string();
            Ok(NormalizedTransaction { id, raw })
        }

        async fn receive_transactions(
            &self,
            txs: Vec<NormalizedTransaction>,
        ) -> Result<(), CollabError> {
            self.received.lock().extend(txs);
            Ok(())
        }

        fn unconfirmed_list(&self) -> Vec<Value> {
            self.unconfirmed.lock().clone()
        }
    }

    #[derive(Default)]
    pub struct MockSignatures {
        pub processed: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl SignatureProcessor for MockSignatures {
        async fn process_signature(&self, signature: Value) -> Result<(), CollabError> {
            self.processed.lock().push(signature);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MockDapps {
        pub messages: Mutex<Vec<Value>>,
        pub requests: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl DappBridge for MockDapps {
        async fn message(&self, _dappid: &str, body: Value) -> Result<Value, CollabError> {
            self.messages.lock().push(body);
            Ok(serde_json::json!({}))
        }

        async fn request(
            &self,
            dappid: &str,
            method: &str,
            path: &str,
            _query: Value,
        ) -> Result<Value, CollabError> {
            self.requests
                .lock()
                .push((dappid.to_string(), method.to_string(), path.to_string()));
            Ok(serde_json::json!({ "body": {} }))
        }
    }

    #[derive(Default)]
    pub struct MockForging {
        pub enabled: AtomicUsize,
    }

    impl ForgingControl for MockForging {
        fn enable_forging(&self) {
            self.enabled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct MockSockets {
        pub emitted: Mutex<Vec<(String, Value)>>,
    }

    impl SocketHub for MockSockets {
        fn emit(&self, event: &str, payload: Value) {
            self.emitted.lock().push((event.to_string(), payload));
        }
    }

    /// Bundle of mocks plus the context wired over them.
    pub struct MockWorld {
        pub chain: Arc<MockChain>,
        pub pool: Arc<MockPool>,
        pub signatures: Arc<MockSignatures>,
        pub dapps: Arc<MockDapps>,
        pub forging: Arc<MockForging>,
        pub sockets: Arc<MockSockets>,
        pub ctx: AppContext,
    }

    pub fn mock_context() -> MockWorld {
        let chain = Arc::new(MockChain::default());
        let pool = Arc::new(MockPool::default());
        let signatures = Arc::new(MockSignatures::default());
        let dapps = Arc::new(MockDapps::default());
        let forging = Arc::new(MockForging::default());
        let sockets = Arc::new(MockSockets::default());
        let (bus, _) = broadcast::channel(256);

        let ctx = AppContext {
            chain: chain.clone(),
            transactions: pool.clone(),
            signatures: signatures.clone(),
            dapps: dapps.clone(),
            forging: forging.clone(),
            sockets: sockets.clone(),
            bus,
            db_sequence: Sequence::new("db"),
            balances_sequence: Sequence::new("balances"),
        };

        MockWorld { chain, pool, signatures, dapps, forging, sockets, ctx }
    }
}
