//! Node Wiring
//!
//! Ties the subsystem together: builds the directory and transport over
//! one application context, serves the peer and management APIs, and
//! drives the lifecycle (bind, blockchain-ready bootstrap, periodic
//! loops, shutdown).

use crate::api::api_router;
use crate::config::{NodeConfig, SystemInfo};
use crate::context::{
    AppContext, ChainClient, DappBridge, ForgingControl, NodeEvent, SignatureProcessor,
    SocketHub, TransactionPool,
};
use crate::peers::{MemoryPeerStore, PeerDirectory, PeerStore};
use crate::sequence::Sequence;
use crate::transport::events::spawn_event_hooks;
use crate::transport::{peer_router, PeerApi, PeerClient, TransportStats};

use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Constructed, not yet serving
    Starting,
    /// Serving; directory bootstrap may still be pending
    Running,
    /// Shutdown requested
    Stopping,
    /// Fully stopped
    Stopped,
}

/// Collaborator handles injected by the embedding node.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainClient>,
    pub transactions: Arc<dyn TransactionPool>,
    pub signatures: Arc<dyn SignatureProcessor>,
    pub dapps: Arc<dyn DappBridge>,
    pub forging: Arc<dyn ForgingControl>,
    pub sockets: Arc<dyn SocketHub>,
}

/// Node errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// The peer subsystem, wired and ready to serve.
pub struct Node {
    config: NodeConfig,
    system: SystemInfo,
    ctx: AppContext,
    directory: Arc<PeerDirectory>,
    client: Arc<PeerClient>,
    peer_api: Arc<PeerApi>,
    loaded: Arc<AtomicBool>,
    status: Arc<RwLock<NodeStatus>>,
    handles: Vec<JoinHandle<()>>,
    peer_addr: Option<SocketAddr>,
    api_addr: Option<SocketAddr>,
}

impl Node {
    /// Construct over the default in-memory store.
    pub fn new(config: NodeConfig, collaborators: Collaborators) -> NodeResult<Self> {
        Self::with_store(config, collaborators, Arc::new(MemoryPeerStore::new()))
    }

    /// Construct over a caller-provided peer store.
    pub fn with_store(
        config: NodeConfig,
        collaborators: Collaborators,
        store: Arc<dyn PeerStore>,
    ) -> NodeResult<Self> {
        config.validate()?;

        let system = SystemInfo::from_config(&config);
        let (bus, _) = broadcast::channel(1024);

        let ctx = AppContext {
            chain: collaborators.chain,
            transactions: collaborators.transactions,
            signatures: collaborators.signatures,
            dapps: collaborators.dapps,
            forging: collaborators.forging,
            sockets: collaborators.sockets,
            bus,
            db_sequence: Sequence::new("db"),
            balances_sequence: Sequence::new("balances"),
        };

        let directory = PeerDirectory::new(&config, store, Arc::clone(&ctx.db_sequence));
        let loaded = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TransportStats::default());

        let client = PeerClient::new(
            &config,
            &system,
            Arc::clone(&directory),
            Arc::clone(&loaded),
            Arc::clone(&stats),
        )?;
        directory.bind_exchange(client.clone());

        let peer_api = PeerApi::new(
            system.clone(),
            Arc::clone(&directory),
            ctx.clone(),
            Arc::clone(&loaded),
            stats,
        );

        Ok(Self {
            config,
            system,
            ctx,
            directory,
            client,
            peer_api,
            loaded,
            status: Arc::new(RwLock::new(NodeStatus::Starting)),
            handles: Vec::new(),
            peer_addr: None,
            api_addr: None,
        })
    }

    /// Bind the two listeners and start serving.
    pub async fn start(&mut self) -> NodeResult<()> {
        info!("Starting peer subsystem...");
        info!("  Network: {}", self.config.network);
        info!("  Nethash: {}", self.config.nethash);

        let peer_listener = tokio::net::TcpListener::bind(self.config.peer_addr)
            .await
            .map_err(|e| NodeError::Bind(e.to_string()))?;
        let api_listener = tokio::net::TcpListener::bind(self.config.api_addr)
            .await
            .map_err(|e| NodeError::Bind(e.to_string()))?;

        self.peer_addr = peer_listener.local_addr().ok();
        self.api_addr = api_listener.local_addr().ok();

        let peer_app = peer_router(Arc::clone(&self.peer_api));
        self.handles.push(tokio::spawn(async move {
            axum::serve(
                peer_listener,
                peer_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .ok();
        }));

        let api_app = api_router(Arc::clone(&self.directory), self.system.clone());
        self.handles.push(tokio::spawn(async move {
            axum::serve(api_listener, api_app.into_make_service()).await.ok();
        }));

        self.handles.push(spawn_event_hooks(
            Arc::clone(&self.client),
            self.ctx.clone(),
            Arc::clone(&self.loaded),
        ));

        *self.status.write() = NodeStatus::Running;
        info!("  Peer API on {}", self.peer_addr.unwrap_or(self.config.peer_addr));
        info!("  Management API on {}", self.api_addr.unwrap_or(self.config.api_addr));

        Ok(())
    }

    /// Blockchain-ready hook: open the transport, bootstrap the seeds,
    /// then start the periodic loops once the directory signals ready.
    pub async fn on_blockchain_ready(&mut self) {
        self.loaded.store(true, Ordering::SeqCst);
        self.directory.on_blockchain_ready().await;
        self.handles.extend(self.directory.spawn_loops());
    }

    /// Stop serving. In-flight work finishes naturally; new inbound and
    /// outbound activity short-circuits.
    pub async fn stop(&mut self) {
        *self.status.write() = NodeStatus::Stopping;
        self.loaded.store(false, Ordering::SeqCst);

        for handle in self.handles.drain(..) {
            handle.abort();
        }

        *self.status.write() = NodeStatus::Stopped;
        info!("Peer subsystem stopped");
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        &self.client
    }

    /// Publish an event onto the node bus.
    pub fn publish(&self, event: NodeEvent) {
        self.ctx.publish(event);
    }

    /// Bound peer-API address, once started.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Bound management-API address, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("status", &self.status())
            .field("network", &self.config.network)
            .finish()
    }
}
