//! Mempool - transactions admitted but not yet committed
//!
//! A flat set behind one lock. There is no per-sender queue, so eligibility
//! for the next block is recomputed against ledger state by [`Mempool::ready`].

use crate::error::{MempoolError, StoreError};
use crate::ledger::LedgerStore;
use crate::processor;
use crate::types::{Address, Signature, Transaction};
use crate::MEMPOOL_CAPACITY;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

pub struct Mempool {
    pending: Mutex<Vec<Transaction>>,
    capacity: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(MEMPOOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Insert a transaction after the stateless checks: capacity, duplicate
    /// signature, signature validity
    pub fn add(&self, tx: Transaction) -> Result<(), MempoolError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            return Err(MempoolError::Full);
        }
        if pending.iter().any(|p| p.signature == tx.signature) {
            return Err(MempoolError::Duplicate);
        }
        if tx.verify_signature().is_err() {
            return Err(MempoolError::InvalidSignature);
        }
        pending.push(tx);
        Ok(())
    }

    /// Submission path for API and gossip input: state checks against
    /// `store`, then [`Mempool::add`]
    pub fn admit(&self, tx: Transaction, store: &dyn LedgerStore) -> Result<(), MempoolError> {
        processor::check_transaction(&tx, store)?;
        self.add(tx)
    }

    /// Drop every pending transaction whose signature matches one in `txs`
    pub fn remove(&self, txs: &[Transaction]) -> usize {
        let settled: HashSet<Signature> = txs.iter().map(|tx| tx.signature).collect();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|tx| !settled.contains(&tx.signature));
        before - pending.len()
    }

    /// Transactions eligible for the next block, at most `limit` of them.
    ///
    /// Entries that can never become valid again (nonce already used,
    /// amount above the sender's whole balance) are purged. Transactions
    /// with a future nonce stay pending. When a sender has several
    /// transactions with the same nonce, the smallest signature is taken.
    pub fn ready(
        &self,
        store: &dyn LedgerStore,
        limit: usize,
    ) -> Result<Vec<Transaction>, StoreError> {
        let snapshot = self.pending();

        let mut by_sender: BTreeMap<Address, Vec<Transaction>> = BTreeMap::new();
        let mut stale: HashSet<Signature> = HashSet::new();

        for tx in snapshot {
            if tx.is_reward() || tx.to == Address::REWARD {
                stale.insert(tx.signature);
            } else {
                by_sender.entry(tx.from).or_default().push(tx);
            }
        }

        let mut ready = Vec::new();
        for (sender, mut txs) in by_sender {
            let wallet = store.wallet(&sender)?;
            txs.sort_by(|a, b| a.nonce.cmp(&b.nonce).then(a.signature.cmp(&b.signature)));

            let mut expected = wallet.nonce + 1;
            let mut budget = wallet.balance;
            for tx in txs {
                if tx.nonce <= wallet.nonce || tx.debit() > wallet.balance {
                    stale.insert(tx.signature);
                } else if tx.nonce == expected && tx.debit() <= budget {
                    expected += 1;
                    budget -= tx.debit();
                    ready.push(tx);
                }
            }
        }

        if !stale.is_empty() {
            tracing::debug!("Purging {} stale transactions from mempool", stale.len());
            self.pending.lock().retain(|tx| !stale.contains(&tx.signature));
        }

        ready.truncate(limit);
        Ok(ready)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Snapshot of all pending transactions
    pub fn pending(&self) -> Vec<Transaction> {
        self.pending.lock().clone()
    }
}
