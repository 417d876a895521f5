//! Ledger state store: blocks by height, wallets and validator stakes

use crate::error::StoreError;
use crate::types::{stake_total, Address, Block, Validator, Wallet};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Key-value persistence consumed by consensus, sync and the RPC server.
///
/// Calls are synchronous and complete before the caller moves on.
pub trait LedgerStore: Send + Sync {
    /// Store a block and advance the tip if it is higher
    fn put_block(&self, block: &Block) -> Result<(), StoreError>;

    fn get_block(&self, height: u64) -> Result<Option<Block>, StoreError>;

    /// Height of the highest stored block, `None` before genesis
    fn tip_height(&self) -> Result<Option<u64>, StoreError>;

    /// Wallet of `address`; addresses never seen have a zero wallet
    fn wallet(&self, address: &Address) -> Result<Wallet, StoreError>;

    fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError>;

    fn validator(&self, address: &Address) -> Result<Option<Validator>, StoreError>;

    fn put_validator(&self, validator: &Validator) -> Result<(), StoreError>;

    /// Validators with non-zero stake, ordered by address
    fn validators(&self) -> Result<Vec<Validator>, StoreError>;

    /// Persist a block together with the wallet and validator records it changed.
    ///
    /// The default writes entries one by one; stores that can write
    /// atomically override it.
    fn commit_block(
        &self,
        block: &Block,
        wallets: &[Wallet],
        validators: &[Validator],
    ) -> Result<(), StoreError> {
        for wallet in wallets {
            self.put_wallet(wallet)?;
        }
        for validator in validators {
            self.put_validator(validator)?;
        }
        self.put_block(block)
    }

    /// The highest stored block
    fn tip(&self) -> Result<Block, StoreError> {
        let height = self.tip_height()?.ok_or(StoreError::Empty)?;
        self.get_block(height)?.ok_or(StoreError::Empty)
    }

    /// Sum of all validator stakes
    fn total_stake(&self) -> Result<u64, StoreError> {
        stake_total(&self.validators()?).ok_or(StoreError::StakeOverflow)
    }
}

/// Thread-safe in-memory ledger
///
/// Uses DashMap for concurrent reads from the RPC server while the
/// consensus task writes.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    blocks: Arc<DashMap<u64, Block>>,
    wallets: Arc<DashMap<Address, Wallet>>,
    validators: Arc<DashMap<Address, Validator>>,
    tip: Arc<RwLock<Option<u64>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl LedgerStore for MemoryLedger {
    fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        self.blocks.insert(block.height, block.clone());
        let mut tip = self.tip.write();
        if tip.map_or(true, |h| block.height > h) {
            *tip = Some(block.height);
        }
        Ok(())
    }

    fn get_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        Ok(self.blocks.get(&height).map(|r| r.value().clone()))
    }

    fn tip_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(*self.tip.read())
    }

    fn wallet(&self, address: &Address) -> Result<Wallet, StoreError> {
        Ok(self
            .wallets
            .get(address)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| Wallet::empty(*address)))
    }

    fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        self.wallets.insert(wallet.address, wallet.clone());
        Ok(())
    }

    fn validator(&self, address: &Address) -> Result<Option<Validator>, StoreError> {
        Ok(self.validators.get(address).map(|r| r.value().clone()))
    }

    fn put_validator(&self, validator: &Validator) -> Result<(), StoreError> {
        self.validators.insert(validator.address, validator.clone());
        Ok(())
    }

    fn validators(&self) -> Result<Vec<Validator>, StoreError> {
        let mut list: Vec<Validator> = self
            .validators
            .iter()
            .filter(|r| r.value().stake > 0)
            .map(|r| r.value().clone())
            .collect();
        list.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, Signature};

    fn block(height: u64) -> Block {
        Block {
            height,
            round: 0,
            timestamp: 0,
            prev_hash: Hash::default(),
            hash: Hash([height as u8; 32]),
            proposer: Address::default(),
            signature: Signature::EMPTY,
            transactions: vec![],
        }
    }

    #[test]
    fn test_unknown_wallet_is_zero() {
        let store = MemoryLedger::new();
        let address = Address([3u8; 32]);
        assert_eq!(store.wallet(&address).unwrap(), Wallet::empty(address));
    }

    #[test]
    fn test_tip_tracks_highest_block() {
        let store = MemoryLedger::new();
        assert!(matches!(store.tip(), Err(StoreError::Empty)));

        store.put_block(&block(0)).unwrap();
        store.put_block(&block(1)).unwrap();
        assert_eq!(store.tip().unwrap().height, 1);
        assert_eq!(store.get_block(0).unwrap().unwrap().height, 0);
        assert!(store.get_block(5).unwrap().is_none());
    }

    #[test]
    fn test_validators_sorted_and_zero_stake_hidden() {
        let store = MemoryLedger::new();
        for (byte, stake) in [(9u8, 3u64), (1, 2), (5, 0)] {
            store
                .put_validator(&Validator {
                    address: Address([byte; 32]),
                    stake,
                })
                .unwrap();
        }
        let list = store.validators().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].address, Address([1u8; 32]));
        assert_eq!(store.total_stake().unwrap(), 5);
    }
}
