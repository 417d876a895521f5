//! Persistence Layer for ledger state
//!
//! Uses sled embedded database. Blocks are keyed by big-endian height so
//! iteration follows the chain; wallets and validators are keyed by address.

use crate::error::StoreError;
use crate::ledger::LedgerStore;
use crate::types::{Address, Block, Validator, Wallet};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional};
use std::path::Path;

const TIP_KEY: &[u8] = b"tip";

/// Sled-backed ledger
pub struct SledLedger {
    /// Sled database instance
    db: Db,
    /// Blocks by height
    blocks: sled::Tree,
    /// Wallets by address
    wallets: sled::Tree,
    /// Validators by address
    validators: sled::Tree,
    /// Chain metadata (tip height)
    metadata: sled::Tree,
}

impl SledLedger {
    /// Open or create a ledger at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        let blocks = db.open_tree("blocks")?;
        let wallets = db.open_tree("wallets")?;
        let validators = db.open_tree("validators")?;
        let metadata = db.open_tree("metadata")?;

        tracing::info!("Opened ledger at {:?}", path.as_ref());

        Ok(Self {
            db,
            blocks,
            wallets,
            validators,
            metadata,
        })
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn read_tip(&self) -> Result<Option<u64>, StoreError> {
        match self.metadata.get(TIP_KEY)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Codec("corrupt tip height".to_string()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    fn next_tip(&self, height: u64) -> Result<u64, StoreError> {
        Ok(self.read_tip()?.map_or(height, |tip| tip.max(height)))
    }
}

impl LedgerStore for SledLedger {
    fn put_block(&self, block: &Block) -> Result<(), StoreError> {
        let bytes = bincode::serialize(block)?;
        let tip = self.next_tip(block.height)?;
        self.blocks.insert(block.height.to_be_bytes(), bytes)?;
        self.metadata.insert(TIP_KEY, tip.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn get_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.blocks.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn tip_height(&self) -> Result<Option<u64>, StoreError> {
        self.read_tip()
    }

    fn wallet(&self, address: &Address) -> Result<Wallet, StoreError> {
        match self.wallets.get(address.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Wallet::empty(*address)),
        }
    }

    fn put_wallet(&self, wallet: &Wallet) -> Result<(), StoreError> {
        let bytes = bincode::serialize(wallet)?;
        self.wallets.insert(wallet.address.as_bytes(), bytes)?;
        Ok(())
    }

    fn validator(&self, address: &Address) -> Result<Option<Validator>, StoreError> {
        match self.validators.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_validator(&self, validator: &Validator) -> Result<(), StoreError> {
        let bytes = bincode::serialize(validator)?;
        self.validators.insert(validator.address.as_bytes(), bytes)?;
        Ok(())
    }

    fn validators(&self) -> Result<Vec<Validator>, StoreError> {
        let mut list = Vec::new();
        for result in self.validators.iter() {
            let (_, value) = result?;
            let validator: Validator = bincode::deserialize(&value)?;
            if validator.stake > 0 {
                list.push(validator);
            }
        }
        Ok(list)
    }

    /// Writes the block, its state changes and the new tip in one sled transaction
    fn commit_block(
        &self,
        block: &Block,
        wallets: &[Wallet],
        validators: &[Validator],
    ) -> Result<(), StoreError> {
        let block_bytes = bincode::serialize(block)?;
        let tip = self.next_tip(block.height)?;
        let wallet_entries = wallets
            .iter()
            .map(|w| Ok((w.address, bincode::serialize(w)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let validator_entries = validators
            .iter()
            .map(|v| Ok((v.address, bincode::serialize(v)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        (&self.blocks, &self.wallets, &self.validators, &self.metadata)
            .transaction(|(blocks, wallet_tree, validator_tree, metadata)| {
                for (address, bytes) in &wallet_entries {
                    wallet_tree.insert(address.as_bytes().as_slice(), bytes.as_slice())?;
                }
                for (address, bytes) in &validator_entries {
                    validator_tree.insert(address.as_bytes().as_slice(), bytes.as_slice())?;
                }
                blocks.insert(block.height.to_be_bytes().to_vec(), block_bytes.as_slice())?;
                metadata.insert(TIP_KEY, tip.to_be_bytes().to_vec())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(()) => StoreError::Aborted,
            })?;

        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Hash, Signature};
    use tempfile::tempdir;

    fn block(height: u64) -> Block {
        Block {
            height,
            round: 0,
            timestamp: 1234,
            prev_hash: Hash::default(),
            hash: Hash([height as u8; 32]),
            proposer: Address([1u8; 32]),
            signature: Signature::EMPTY,
            transactions: vec![],
        }
    }

    #[test]
    fn test_store_and_load_block() {
        let dir = tempdir().unwrap();
        let store = SledLedger::open(dir.path()).unwrap();

        store.put_block(&block(0)).unwrap();
        store.put_block(&block(1)).unwrap();
        store.flush().unwrap();

        assert_eq!(store.tip().unwrap(), block(1));
        assert_eq!(store.get_block(0).unwrap().unwrap(), block(0));
        assert!(store.get_block(2).unwrap().is_none());
    }

    #[test]
    fn test_commit_block_writes_state() {
        let dir = tempdir().unwrap();
        let store = SledLedger::open(dir.path()).unwrap();
        let address = Address([7u8; 32]);

        let wallet = Wallet {
            address,
            balance: 40,
            nonce: 2,
        };
        let validator = Validator { address, stake: 3 };
        store.commit_block(&block(0), &[wallet.clone()], &[validator.clone()]).unwrap();

        assert_eq!(store.tip_height().unwrap(), Some(0));
        assert_eq!(store.wallet(&address).unwrap(), wallet);
        assert_eq!(store.validator(&address).unwrap(), Some(validator));
        assert_eq!(store.wallet(&Address([8u8; 32])).unwrap().balance, 0);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = SledLedger::open(dir.path()).unwrap();
            store.commit_block(&block(0), &[], &[]).unwrap();
        }
        let store = SledLedger::open(dir.path()).unwrap();
        assert_eq!(store.tip_height().unwrap(), Some(0));
    }
}
