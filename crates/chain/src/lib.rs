//! Chain - data model, mempool and ledger state for the proof-of-stake node
//!
//! This crate holds everything a node needs to agree on without talking to peers:
//! - Transactions, blocks, votes and their canonical (signed) encoding
//! - The mempool of admitted transactions awaiting inclusion
//! - The ledger state store (in-memory and sled-backed)
//! - The state transition rules shared by live consensus and sync

pub mod block_producer;
pub mod crypto;
pub mod error;
pub mod genesis;
pub mod ledger;
pub mod mempool;
pub mod persistence;
pub mod processor;
pub mod types;

pub use block_producer::{BlockProducer, BlockProducerConfig};
pub use crypto::{Keypair, KeyFile};
pub use error::{BlockError, MempoolError, StoreError, TxError};
pub use genesis::GenesisConfig;
pub use ledger::{LedgerStore, MemoryLedger};
pub use mempool::Mempool;
pub use persistence::SledLedger;
pub use types::*;

/// Maximum number of pending transactions held by the mempool
pub const MEMPOOL_CAPACITY: usize = 1000;

/// Fixed amount paid to the proposer of every block
pub const REWARD_AMOUNT: u64 = 1;

/// Maximum transactions per block (reward excluded)
pub const MAX_TXS_PER_BLOCK: usize = 500;

/// Current unix time in milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
