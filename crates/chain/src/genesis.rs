//! Genesis - the initial allocation of stake and balances
//!
//! Every node builds the same height-0 block from the same genesis file, so
//! the genesis hash commits to the allocation.

use crate::error::StoreError;
use crate::ledger::LedgerStore;
use crate::processor;
use crate::types::{stake_total, Address, Block, Hash, Signature, Transaction, Validator};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub address: Address,
    pub stake: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub address: Address,
    pub amount: u64,
}

/// Genesis file contents (JSON)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Unix millis stamped on the genesis block and its entries
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub balances: Vec<GenesisBalance>,
}

impl GenesisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_validator(mut self, address: Address, stake: u64) -> Self {
        self.validators.push(GenesisValidator { address, stake });
        self
    }

    pub fn with_balance(mut self, address: Address, amount: u64) -> Self {
        self.balances.push(GenesisBalance { address, amount });
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The unsigned height-0 block: one stake deposit per validator and one
    /// `reward`-sourced grant per balance. Deposits from the same address
    /// take nonces 1, 2, ... as they would on a running chain.
    pub fn block(&self) -> Block {
        let mut nonces: HashMap<Address, u64> = HashMap::new();
        let stakes = self.validators.iter().map(|v| {
            let nonce = nonces.entry(v.address).or_insert(0);
            *nonce += 1;
            Transaction {
                from: v.address,
                to: Address::STAKE,
                amount: v.stake,
                timestamp: self.timestamp,
                nonce: *nonce,
                signature: Signature::EMPTY,
            }
        });
        let grants = self.balances.iter().map(|b| Transaction {
            from: Address::REWARD,
            to: b.address,
            amount: b.amount,
            timestamp: self.timestamp,
            nonce: 0,
            signature: Signature::EMPTY,
        });

        let mut block = Block {
            height: 0,
            round: 0,
            timestamp: self.timestamp,
            prev_hash: Hash::default(),
            hash: Hash::default(),
            proposer: Address::default(),
            signature: Signature::EMPTY,
            transactions: stakes.chain(grants).collect(),
        };
        block.sort_transactions();
        block.hash = block.compute_hash();
        block
    }

    /// Apply the genesis block to an empty ledger. A ledger that already has
    /// a chain is left untouched and its tip returned.
    pub fn initialize(&self, store: &dyn LedgerStore) -> Result<Block, StoreError> {
        if store.tip_height()?.is_some() {
            return store.tip();
        }
        let validators: Vec<Validator> = self
            .validators
            .iter()
            .map(|v| Validator {
                address: v.address,
                stake: v.stake,
            })
            .collect();
        stake_total(&validators).ok_or(StoreError::StakeOverflow)?;

        let block = self.block();
        processor::apply_block(&block, store)?;
        tracing::info!(
            "Initialized genesis {} with {} validators and {} balances",
            block.hash,
            self.validators.len(),
            self.balances.len()
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::ledger::MemoryLedger;
    use tempfile::tempdir;

    fn config() -> GenesisConfig {
        GenesisConfig::new()
            .with_timestamp(1_700_000_000_000)
            .with_validator(Keypair::from_seed([1u8; 32]).address(), 3)
            .with_balance(Keypair::from_seed([2u8; 32]).address(), 50)
    }

    #[test]
    fn test_genesis_block_is_deterministic() {
        let a = config().block();
        let b = config().block();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, a.compute_hash());

        let other = config().with_balance(Address([9u8; 32]), 1).block();
        assert_ne!(a.hash, other.hash);
    }

    #[test]
    fn test_initialize_applies_allocation_once() {
        let store = MemoryLedger::new();
        let genesis = config().initialize(&store).unwrap();
        assert_eq!(store.tip().unwrap(), genesis);

        let validator = Keypair::from_seed([1u8; 32]).address();
        let holder = Keypair::from_seed([2u8; 32]).address();
        assert_eq!(store.validator(&validator).unwrap().unwrap().stake, 3);
        assert_eq!(store.wallet(&holder).unwrap().balance, 50);
        assert_eq!(store.wallet(&validator).unwrap().balance, 0);
        assert_eq!(store.wallet(&validator).unwrap().nonce, 1);

        config().initialize(&store).unwrap();
        assert_eq!(store.wallet(&holder).unwrap().balance, 50);
    }

    #[test]
    fn test_repeated_validator_takes_next_nonce() {
        let validator = Keypair::from_seed([1u8; 32]).address();
        let store = MemoryLedger::new();
        config().with_validator(validator, 4).initialize(&store).unwrap();
        assert_eq!(store.validator(&validator).unwrap().unwrap().stake, 7);
        assert_eq!(store.wallet(&validator).unwrap().nonce, 2);
    }

    #[test]
    fn test_genesis_stake_must_fit_u64() {
        let store = MemoryLedger::new();
        let result = config()
            .with_validator(Address([7u8; 32]), u64::MAX)
            .initialize(&store);
        assert!(matches!(result, Err(StoreError::StakeOverflow)));
        assert!(store.tip_height().unwrap().is_none());
    }

    #[test]
    fn test_genesis_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        config().save(&path).unwrap();
        assert_eq!(GenesisConfig::load(&path).unwrap(), config());
    }
}
