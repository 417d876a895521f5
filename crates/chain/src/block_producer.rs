//! Block Producer - block assembly for the selected proposer
//!
//! Pulls the ready transactions from the mempool, appends the proposer's
//! reward and seals the block. Nothing is produced while the mempool has
//! nothing eligible.

use crate::crypto::Keypair;
use crate::error::StoreError;
use crate::ledger::LedgerStore;
use crate::mempool::Mempool;
use crate::types::{Block, Transaction};
use crate::MAX_TXS_PER_BLOCK;
use std::sync::Arc;
use std::time::Instant;

/// Block producer configuration
#[derive(Clone, Debug)]
pub struct BlockProducerConfig {
    /// Maximum transactions per block, reward excluded
    pub max_txs_per_block: usize,
}

impl Default for BlockProducerConfig {
    fn default() -> Self {
        Self {
            max_txs_per_block: MAX_TXS_PER_BLOCK,
        }
    }
}

pub struct BlockProducer {
    keypair: Keypair,
    mempool: Arc<Mempool>,
    store: Arc<dyn LedgerStore>,
    config: BlockProducerConfig,
}

impl BlockProducer {
    pub fn new(
        keypair: Keypair,
        mempool: Arc<Mempool>,
        store: Arc<dyn LedgerStore>,
        config: BlockProducerConfig,
    ) -> Self {
        Self {
            keypair,
            mempool,
            store,
            config,
        }
    }

    /// Assemble and seal a block on top of `parent` for `round`.
    ///
    /// Returns `None` when no pending transaction is eligible.
    pub fn try_produce(&self, parent: &Block, round: u32) -> Result<Option<Block>, StoreError> {
        let start = Instant::now();
        let mut txs = self
            .mempool
            .ready(self.store.as_ref(), self.config.max_txs_per_block)?;
        if txs.is_empty() {
            return Ok(None);
        }

        let tx_count = txs.len();
        let timestamp = crate::now_millis();
        txs.push(Transaction::reward(&self.keypair, timestamp));

        let mut block = Block::new(parent, round, self.keypair.address(), txs);
        block.timestamp = timestamp;
        let block = block.seal(&self.keypair);

        tracing::debug!(
            "Assembled block {} round {} | {} txs | {:.2}ms",
            block.height,
            round,
            tx_count,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisConfig;
    use crate::ledger::MemoryLedger;
    use crate::processor;

    #[test]
    fn test_produces_only_with_ready_transactions() {
        let proposer = Keypair::from_seed([1u8; 32]);
        let alice = Keypair::from_seed([2u8; 32]);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let genesis = GenesisConfig::new()
            .with_validator(proposer.address(), 1)
            .with_balance(alice.address(), 10)
            .initialize(store.as_ref())
            .unwrap();

        let mempool = Arc::new(Mempool::new());
        let producer = BlockProducer::new(
            proposer.clone(),
            mempool.clone(),
            store.clone(),
            BlockProducerConfig::default(),
        );
        assert!(producer.try_produce(&genesis, 0).unwrap().is_none());

        let tx = Transaction::transfer(&alice, proposer.address(), 3, 1);
        mempool.admit(tx.clone(), store.as_ref()).unwrap();
        let block = producer.try_produce(&genesis, 0).unwrap().unwrap();

        assert_eq!(block.height, 1);
        assert_eq!(block.prev_hash, genesis.hash);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions.contains(&tx));
        assert!(block.verify_signature().is_ok());
        assert!(processor::check_block_transactions(&block, store.as_ref()).is_ok());
    }

    #[test]
    fn test_respects_block_limit() {
        let proposer = Keypair::from_seed([1u8; 32]);
        let alice = Keypair::from_seed([2u8; 32]);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let genesis = GenesisConfig::new()
            .with_validator(proposer.address(), 1)
            .with_balance(alice.address(), 100)
            .initialize(store.as_ref())
            .unwrap();

        let mempool = Arc::new(Mempool::new());
        for nonce in 1..=5 {
            mempool
                .add(Transaction::transfer(&alice, proposer.address(), 1, nonce))
                .unwrap();
        }
        let producer = BlockProducer::new(
            proposer,
            mempool,
            store.clone(),
            BlockProducerConfig {
                max_txs_per_block: 2,
            },
        );
        let block = producer.try_produce(&genesis, 0).unwrap().unwrap();
        assert_eq!(block.transactions.len(), 3);
        assert!(processor::check_block_transactions(&block, store.as_ref()).is_ok());
    }
}
