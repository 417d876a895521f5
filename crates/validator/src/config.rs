//! Node configuration: command line and the consensus tuning derived from it

use clap::{Parser, ValueEnum};
use pos_consensus::{ConsensusConfig, Quorum};
use std::path::PathBuf;
use std::time::Duration;

/// What the binary does
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run a validator node
    Run,
    /// Create a key file and print its address
    Keygen,
    /// Write a genesis file staking this node's key
    Genesis,
}

/// Proof-of-stake validator node
#[derive(Parser, Debug)]
#[command(name = "pos-node")]
#[command(about = "Stake-weighted proof-of-stake validator node", long_about = None)]
pub struct Args {
    #[arg(long, value_enum, default_value = "run")]
    pub mode: Mode,

    /// Data directory for the ledger
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Key file (created on first run)
    #[arg(long, default_value = "./node-key.json")]
    pub key_file: PathBuf,

    /// Genesis file, read when the ledger is empty and written in genesis mode
    #[arg(long, default_value = "./genesis.json")]
    pub genesis: PathBuf,

    /// Peer-to-peer listen address
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub p2p_addr: String,

    /// Peer listen addresses (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// HTTP RPC bind address
    #[arg(long, default_value = "127.0.0.1:8899")]
    pub rpc_addr: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Stake written for this key in genesis mode
    #[arg(long, default_value = "1")]
    pub stake: u64,

    /// Balance granted to this key in genesis mode
    #[arg(long, default_value = "0")]
    pub balance: u64,

    #[arg(long, default_value = "100")]
    pub poll_interval_ms: u64,

    /// How long a proposer waits for quorum
    #[arg(long, default_value = "10000")]
    pub vote_timeout_ms: u64,

    /// How long a round may stall before moving to the next proposer
    #[arg(long, default_value = "30000")]
    pub round_timeout_ms: u64,

    /// Quorum as a fraction of total stake, e.g. 2/3
    #[arg(long, default_value = "2/3", value_parser = parse_quorum)]
    pub quorum: Quorum,

    #[arg(long, default_value = "500")]
    pub max_txs_per_block: usize,
}

fn parse_quorum(s: &str) -> Result<Quorum, String> {
    let (num, den) = s
        .split_once('/')
        .ok_or_else(|| format!("expected numerator/denominator, got {:?}", s))?;
    let numerator: u64 = num.trim().parse().map_err(|e| format!("bad numerator: {}", e))?;
    let denominator: u64 = den.trim().parse().map_err(|e| format!("bad denominator: {}", e))?;
    if denominator == 0 || numerator == 0 || numerator > denominator {
        return Err(format!("quorum must be in (0, 1], got {}", s));
    }
    Ok(Quorum {
        numerator,
        denominator,
    })
}

/// Settings for `--mode run`
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub rpc_addr: String,
    pub p2p_addr: String,
    pub peers: Vec<String>,
    pub data_dir: PathBuf,
    pub key_file: PathBuf,
    pub genesis: PathBuf,
    pub poll_interval_ms: u64,
    pub vote_timeout_ms: u64,
    pub round_timeout_ms: u64,
    pub quorum: Quorum,
    pub max_txs_per_block: usize,
}

impl From<&Args> for ValidatorConfig {
    fn from(args: &Args) -> Self {
        Self {
            rpc_addr: args.rpc_addr.clone(),
            p2p_addr: args.p2p_addr.clone(),
            peers: args.peers.clone(),
            data_dir: args.data_dir.clone(),
            key_file: args.key_file.clone(),
            genesis: args.genesis.clone(),
            poll_interval_ms: args.poll_interval_ms,
            vote_timeout_ms: args.vote_timeout_ms,
            round_timeout_ms: args.round_timeout_ms,
            quorum: args.quorum,
            max_txs_per_block: args.max_txs_per_block,
        }
    }
}

impl ValidatorConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            vote_timeout: Duration::from_millis(self.vote_timeout_ms),
            round_timeout: Duration::from_millis(self.round_timeout_ms),
            quorum: self.quorum,
            max_txs_per_block: self.max_txs_per_block,
            ..Default::default()
        }
    }
}
