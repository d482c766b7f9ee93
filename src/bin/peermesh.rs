//! PeerMesh CLI
//!
//! Runs the peer subsystem standalone: a relay that joins the network,
//! keeps its directory fresh and answers the peer protocol, with stub
//! collaborators in place of a full chain. Useful for seeding and for
//! exercising a network without a validator.
//!
//! # Usage
//!
//! ```bash
//! # Start a relay on testnet
//! peermesh node --network testnet
//!
//! # Write a default configuration file
//! peermesh init --path ./peermesh.json
//!
//! # Show the advertised version
//! peermesh version
//! ```

use peermesh::config::{default_config_path, NodeConfig};
use peermesh::context::{
    ChainClient, CollabError, CommonBlock, DappBridge, ForgingControl, NormalizedBlock,
    NormalizedTransaction, SignatureProcessor, SocketHub, TransactionPool,
};
use peermesh::node::{Collaborators, Node};

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PeerMesh - peer membership and gossip relay
#[derive(Parser)]
#[command(name = "peermesh")]
#[command(version)]
#[command(about = "PeerMesh peer directory and gossip relay", long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PEERMESH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a relay node
    Node(NodeArgs),

    /// Write a default configuration file
    Init(InitArgs),

    /// Show version information
    Version,
}

#[derive(Args)]
struct NodeArgs {
    /// Network (mainnet, testnet, devnet)
    #[arg(short, long, default_value = "testnet")]
    network: String,

    /// Override the peer API listen address
    #[arg(long)]
    peer_addr: Option<SocketAddr>,

    /// Override the management API listen address
    #[arg(long)]
    api_addr: Option<SocketAddr>,
}

#[derive(Args)]
struct InitArgs {
    /// Destination path
    #[arg(long)]
    path: Option<PathBuf>,

    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Node(args) => run_node(cli.config, args).await,
        Commands::Init(args) => run_init(args),
        Commands::Version => {
            println!("peermesh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("peermesh={}", default)));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>, network: &str) -> Result<NodeConfig, String> {
    if let Some(path) = path {
        return NodeConfig::load(&path).map_err(|e| e.to_string());
    }

    let default = default_config_path();
    if default.exists() {
        return NodeConfig::load(&default).map_err(|e| e.to_string());
    }

    match network.parse::<peermesh::config::Network>()? {
        peermesh::config::Network::Mainnet => Ok(NodeConfig::mainnet()),
        peermesh::config::Network::Testnet => Ok(NodeConfig::testnet()),
        peermesh::config::Network::Devnet => Ok(NodeConfig::devnet()),
    }
}

async fn run_node(config_path: Option<PathBuf>, args: NodeArgs) -> Result<(), String> {
    let mut config = load_config(config_path, &args.network)?;
    if let Some(addr) = args.peer_addr {
        config.peer_addr = addr;
    }
    if let Some(addr) = args.api_addr {
        config.api_addr = addr;
    }

    let mut node =
        Node::new(config, standalone_collaborators()).map_err(|e| e.to_string())?;

    node.start().await.map_err(|e| e.to_string())?;
    node.on_blockchain_ready().await;

    info!("Relay running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;

    node.stop().await;
    Ok(())
}

fn run_init(args: InitArgs) -> Result<(), String> {
    let path = args.path.unwrap_or_else(default_config_path);
    if path.exists() && !args.force {
        return Err(format!("{} already exists (use --force)", path.display()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }

    let config = NodeConfig::testnet();
    config.save(&path).map_err(|e| e.to_string())?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn standalone_collaborators() -> Collaborators {
    Collaborators {
        chain: Arc::new(RelayChain::default()),
        transactions: Arc::new(RelayPool::default()),
        signatures: Arc::new(RelaySignatures),
        dapps: Arc::new(RelayDapps),
        forging: Arc::new(RelayForging),
        sockets: Arc::new(RelaySockets),
    }
}

/// Chain stub for a standalone relay: accepts well-formed blocks so
/// gossip keeps flowing, stores nothing.
#[derive(Default)]
struct RelayChain {
    last_receipt: Mutex<Option<u64>>,
}

#[async_trait]
impl ChainClient for RelayChain {
    fn normalize_block(&self, raw: Value) -> Result<NormalizedBlock, CollabError> {
        let id = raw
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| CollabError::new("Failed to validate block schema"))?
            .to_string();
        let height = raw.get("height").and_then(|h| h.as_u64()).unwrap_or(0);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        *self.last_receipt.lock() = Some(now);

        Ok(NormalizedBlock { id, height, raw })
    }

    async fn common_block(&self, _ids: &[String]) -> Result<Option<CommonBlock>, CollabError> {
        Ok(None)
    }

    async fn blocks_after(
        &self,
        _last_block_id: Option<&str>,
        _limit: u32,
    ) -> Result<Vec<Value>, CollabError> {
        Ok(Vec::new())
    }

    fn height(&self) -> u64 {
        0
    }

    fn last_receipt(&self) -> Option<u64> {
        *self.last_receipt.lock()
    }
}

/// Pool stub: validates shape and keeps a small relay window.
#[derive(Default)]
struct RelayPool {
    window: Mutex<Vec<Value>>,
}

#[async_trait]
impl TransactionPool for RelayPool {
    fn normalize_transaction(&self, raw: Value) -> Result<NormalizedTransaction, CollabError> {
        let id = raw
            .get("id")
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| CollabError::new("Failed to validate transaction schema"))?
            .to_string();
        Ok(NormalizedTransaction { id, raw })
    }

    async fn receive_transactions(
        &self,
        txs: Vec<NormalizedTransaction>,
    ) -> Result<(), CollabError> {
        let mut window = self.window.lock();
        for tx in txs {
            window.push(tx.raw);
        }
        let excess = window.len().saturating_sub(1000);
        if excess > 0 {
            window.drain(..excess);
        }
        Ok(())
    }

    fn unconfirmed_list(&self) -> Vec<Value> {
        self.window.lock().clone()
    }
}

struct RelaySignatures;

#[async_trait]
impl SignatureProcessor for RelaySignatures {
    async fn process_signature(&self, signature: Value) -> Result<(), CollabError> {
        debug!(?signature, "signature relayed without processing");
        Ok(())
    }
}

struct RelayDapps;

#[async_trait]
impl DappBridge for RelayDapps {
    async fn message(&self, _dappid: &str, _body: Value) -> Result<Value, CollabError> {
        Err(CollabError::new("Dapps are not supported on a relay node"))
    }

    async fn request(
        &self,
        _dappid: &str,
        _method: &str,
        _path: &str,
        _query: Value,
    ) -> Result<Value, CollabError> {
        Err(CollabError::new("Dapps are not supported on a relay node"))
    }
}

struct RelayForging;

impl ForgingControl for RelayForging {
    fn enable_forging(&self) {
        warn!("forging requested on a relay node, ignoring");
    }
}

struct RelaySockets;

impl SocketHub for RelaySockets {
    fn emit(&self, event: &str, _payload: Value) {
        debug!(event, "socket event");
    }
}
