//! Proof-of-stake validator node
//!
//! Main entry point. Opens the sled ledger, joins the peer network over
//! WebSocket, serves JSON-RPC and runs consensus until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use pos_chain::{GenesisConfig, KeyFile, Keypair, LedgerStore, Mempool, SledLedger};
use pos_consensus::{MessageBus, Node, WsBus};
use rpc_server::{HttpRpcServer, RpcContext, RpcServerConfig};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Args, Mode, ValidatorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.mode {
        Mode::Run => run_node(ValidatorConfig::from(&args)).await,
        Mode::Keygen => {
            let keypair = keygen(&args.key_file)?;
            println!("{}", keypair.address());
            Ok(())
        }
        Mode::Genesis => {
            let genesis = write_genesis(&args.key_file, &args.genesis, args.stake, args.balance)?;
            println!("{}", serde_json::to_string_pretty(&genesis)?);
            Ok(())
        }
    }
}

/// Create a key file, refusing to overwrite an existing one
fn keygen(path: &Path) -> Result<Keypair> {
    if path.exists() {
        anyhow::bail!("Key file {:?} already exists", path);
    }
    let keypair = Keypair::generate();
    KeyFile::from_keypair(&keypair).save(path)?;
    tracing::info!("Wrote key file {:?}", path);
    Ok(keypair)
}

/// Genesis staking the key file's address, and optionally funding it
fn write_genesis(key_file: &Path, out: &Path, stake: u64, balance: u64) -> Result<GenesisConfig> {
    let keypair = KeyFile::load_or_create(key_file)?;
    let mut genesis = GenesisConfig::new()
        .with_timestamp(pos_chain::now_millis())
        .with_validator(keypair.address(), stake);
    if balance > 0 {
        genesis = genesis.with_balance(keypair.address(), balance);
    }
    genesis.save(out)?;
    tracing::info!(
        "Wrote genesis {:?}: {} staking {}",
        out,
        keypair.address(),
        stake
    );
    Ok(genesis)
}

async fn run_node(config: ValidatorConfig) -> Result<()> {
    tracing::info!("Starting proof-of-stake node");
    tracing::info!("  P2P: {} ({} peers)", config.p2p_addr, config.peers.len());
    tracing::info!("  HTTP RPC: {}", config.rpc_addr);
    tracing::info!("  Data directory: {:?}", config.data_dir);

    std::fs::create_dir_all(&config.data_dir)?;
    let keypair = KeyFile::load_or_create(&config.key_file)?;
    tracing::info!("  Address: {}", keypair.address());

    let ledger = Arc::new(SledLedger::open(config.ledger_path())?);
    let store: Arc<dyn LedgerStore> = ledger.clone();

    match store.tip_height()? {
        Some(height) => tracing::info!("Loaded ledger at height {}", height),
        None if config.genesis.exists() => {
            let genesis = GenesisConfig::load(&config.genesis)?.initialize(store.as_ref())?;
            tracing::info!("Initialized genesis {} from {:?}", genesis.hash, config.genesis);
        }
        None => tracing::info!("Empty ledger and no genesis file, will sync genesis from peers"),
    }

    let bus = Arc::new(WsBus::new(config.peers.clone(), config.consensus().request_timeout));
    bus.start(&config.p2p_addr).await?;
    let bus: Arc<dyn MessageBus> = bus;

    let mempool = Arc::new(Mempool::new());
    let node = Node::new(keypair, store.clone(), mempool.clone(), bus, config.consensus());

    let rpc_config = RpcServerConfig {
        http_addr: config.rpc_addr.clone(),
    };
    let rpc_context = Arc::new(RpcContext::new(store, mempool, node.handle()));
    let http_server = tokio::spawn(async move {
        let server = HttpRpcServer::new(rpc_context);
        if let Err(e) = server.run(&rpc_config.http_addr).await {
            tracing::error!("HTTP RPC server error: {}", e);
        }
    });

    tracing::info!("Press Ctrl+C to stop.");
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = node.run(shutdown).await;

    http_server.abort();
    if let Err(e) = ledger.flush() {
        tracing::error!("Failed to flush ledger: {}", e);
    }
    tracing::info!("Node stopped");

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keygen_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");

        let keypair = keygen(&path).unwrap();
        assert_eq!(KeyFile::load(&path).unwrap().address(), keypair.address());
        assert!(keygen(&path).is_err());
    }

    #[test]
    fn test_genesis_stakes_key_file_address() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("key.json");
        let genesis_path = dir.path().join("genesis.json");

        let genesis = write_genesis(&key_path, &genesis_path, 3, 50).unwrap();
        let keypair = KeyFile::load(&key_path).unwrap();
        assert_eq!(GenesisConfig::load(&genesis_path).unwrap(), genesis);
        assert_eq!(genesis.validators[0].address, keypair.address());
        assert_eq!(genesis.validators[0].stake, 3);
        assert_eq!(genesis.balances[0].amount, 50);

        let ledger = SledLedger::open(dir.path().join("ledger")).unwrap();
        let block = genesis.initialize(&ledger).unwrap();
        assert_eq!(block.height, 0);
        assert_eq!(ledger.validators().unwrap()[0].stake, 3);
        assert_eq!(ledger.wallet(&keypair.address()).unwrap().balance, 50);
    }
}
