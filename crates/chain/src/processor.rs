//! State transition rules
//!
//! The same checks run at mempool admission, at proposal validation, during
//! sync and when a commit is applied. Block checks are independent of the
//! order transactions appear in, since blocks are sorted by signature and
//! not by nonce.

use crate::error::{BlockError, MempoolError, StoreError, TxError};
use crate::ledger::LedgerStore;
use crate::types::{Address, Block, Transaction, Validator, Wallet};
use crate::REWARD_AMOUNT;
use std::collections::BTreeMap;

/// Check a standalone transaction against current state, as the next one from its sender
pub fn check_transaction(tx: &Transaction, store: &dyn LedgerStore) -> Result<(), MempoolError> {
    if tx.is_reward() {
        return Err(TxError::UnexpectedReward.into());
    }
    if tx.to == Address::REWARD {
        return Err(TxError::ReservedRecipient(tx.to).into());
    }
    if tx.is_stake() {
        store
            .total_stake()?
            .checked_add(tx.amount)
            .ok_or(TxError::Overflow)?;
    }

    let wallet = store.wallet(&tx.from)?;
    let expected = wallet.nonce + 1;
    if tx.nonce != expected {
        return Err(TxError::InvalidNonce {
            expected,
            got: tx.nonce,
        }
        .into());
    }
    if wallet.balance < tx.debit() {
        return Err(TxError::InsufficientBalance {
            balance: wallet.balance,
            needed: tx.debit(),
        }
        .into());
    }
    Ok(())
}

/// Check every transaction in `block` against the state the block builds on.
///
/// - all signatures verify
/// - exactly one reward, paying the proposer the fixed amount
/// - per sender, the nonces form the run `wallet.nonce + 1 ..= wallet.nonce + k`
///   and the amounts fit the sender's balance
/// - stake deposits keep total stake within a u64
pub fn check_block_transactions(block: &Block, store: &dyn LedgerStore) -> Result<(), BlockError> {
    block.verify_transactions()?;

    let rewards: Vec<&Transaction> = block.rewards().collect();
    if rewards.len() != 1 {
        return Err(BlockError::RewardCount(rewards.len()));
    }
    let reward = rewards[0];
    if reward.to != block.proposer {
        return Err(BlockError::RewardRecipient {
            paid: reward.to,
            proposer: block.proposer,
        });
    }
    if reward.amount != REWARD_AMOUNT {
        return Err(BlockError::Sender {
            sender: Address::REWARD,
            source: TxError::InvalidRewardAmount {
                expected: REWARD_AMOUNT,
                got: reward.amount,
            },
        });
    }

    let mut total_stake = store.total_stake()?;
    let mut by_sender: BTreeMap<Address, Vec<&Transaction>> = BTreeMap::new();
    for (index, tx) in block.transactions.iter().enumerate() {
        if tx.is_reward() {
            continue;
        }
        if tx.to == Address::REWARD {
            return Err(BlockError::Transaction {
                index,
                source: TxError::ReservedRecipient(tx.to),
            });
        }
        if tx.is_stake() {
            total_stake = total_stake.checked_add(tx.amount).ok_or(BlockError::Sender {
                sender: Address::STAKE,
                source: TxError::Overflow,
            })?;
        }
        by_sender.entry(tx.from).or_default().push(tx);
    }

    for (sender, mut txs) in by_sender {
        let wallet = store.wallet(&sender)?;
        txs.sort_by_key(|tx| tx.nonce);

        let mut spent: u64 = 0;
        for (offset, tx) in txs.iter().enumerate() {
            let expected = wallet.nonce + 1 + offset as u64;
            if tx.nonce != expected {
                return Err(BlockError::Sender {
                    sender,
                    source: TxError::InvalidNonce {
                        expected,
                        got: tx.nonce,
                    },
                });
            }
            spent = spent.checked_add(tx.debit()).ok_or(BlockError::Sender {
                sender,
                source: TxError::Overflow,
            })?;
        }
        if spent > wallet.balance {
            return Err(BlockError::Sender {
                sender,
                source: TxError::InsufficientBalance {
                    balance: wallet.balance,
                    needed: spent,
                },
            });
        }
    }

    Ok(())
}

/// Summary of an applied block
#[derive(Debug, Clone, Default)]
pub struct BlockEffects {
    pub height: u64,
    pub wallets_changed: usize,
    pub stake_deposited: u64,
}

/// Apply a block's balance, nonce and stake effects and persist it.
///
/// The block must extend the current tip (or be the genesis block of an
/// empty ledger); anything else is refused, so the same block can never be
/// applied twice.
pub fn apply_block(block: &Block, store: &dyn LedgerStore) -> Result<BlockEffects, StoreError> {
    match store.tip_height()? {
        Some(tip) if block.height <= tip => {
            return Err(StoreError::AlreadyApplied {
                height: block.height,
                tip,
            })
        }
        Some(tip) if block.height != tip + 1 => {
            return Err(StoreError::HeightGap {
                height: block.height,
                tip,
            })
        }
        None if block.height != 0 => {
            return Err(StoreError::Empty);
        }
        _ => {}
    }

    let mut wallets: BTreeMap<Address, Wallet> = BTreeMap::new();
    let mut validators: BTreeMap<Address, Validator> = BTreeMap::new();
    let mut effects = BlockEffects {
        height: block.height,
        ..Default::default()
    };

    for tx in &block.transactions {
        if tx.is_reward() {
            let to = load_wallet(&mut wallets, store, tx.to)?;
            to.balance = to.balance.saturating_add(tx.amount);
        } else if tx.is_stake() {
            if !validators.contains_key(&tx.from) {
                let existing = store.validator(&tx.from)?.unwrap_or(Validator {
                    address: tx.from,
                    stake: 0,
                });
                validators.insert(tx.from, existing);
            }
            if let Some(validator) = validators.get_mut(&tx.from) {
                validator.stake = validator.stake.saturating_add(tx.amount);
            }
            effects.stake_deposited = effects.stake_deposited.saturating_add(tx.amount);
            let from = load_wallet(&mut wallets, store, tx.from)?;
            from.nonce += 1;
        } else {
            let from = load_wallet(&mut wallets, store, tx.from)?;
            from.balance = from.balance.saturating_sub(tx.amount);
            from.nonce += 1;
            let to = load_wallet(&mut wallets, store, tx.to)?;
            to.balance = to.balance.saturating_add(tx.amount);
        }
    }

    let wallets: Vec<Wallet> = wallets.into_values().collect();
    let validators: Vec<Validator> = validators.into_values().collect();
    effects.wallets_changed = wallets.len();
    store.commit_block(block, &wallets, &validators)?;

    Ok(effects)
}

fn load_wallet<'a>(
    cache: &'a mut BTreeMap<Address, Wallet>,
    store: &dyn LedgerStore,
    address: Address,
) -> Result<&'a mut Wallet, StoreError> {
    if !cache.contains_key(&address) {
        let wallet = store.wallet(&address)?;
        cache.insert(address, wallet);
    }
    Ok(cache.entry(address).or_insert_with(|| Wallet::empty(address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::genesis::GenesisConfig;
    use crate::ledger::MemoryLedger;

    struct Fixture {
        store: MemoryLedger,
        proposer: Keypair,
        alice: Keypair,
        bob: Keypair,
    }

    fn fixture() -> Fixture {
        let proposer = Keypair::from_seed([1u8; 32]);
        let alice = Keypair::from_seed([2u8; 32]);
        let bob = Keypair::from_seed([3u8; 32]);
        let store = MemoryLedger::new();
        GenesisConfig::new()
            .with_validator(proposer.address(), 1)
            .with_balance(alice.address(), 100)
            .initialize(&store)
            .unwrap();
        Fixture {
            store,
            proposer,
            alice,
            bob,
        }
    }

    fn block_with(f: &Fixture, txs: Vec<Transaction>) -> Block {
        let parent = f.store.tip().unwrap();
        let mut all = txs;
        all.push(Transaction::reward(&f.proposer, 1));
        Block::new(&parent, 0, f.proposer.address(), all).seal(&f.proposer)
    }

    #[test]
    fn test_check_transaction_nonce_and_balance() {
        let f = fixture();
        let ok = Transaction::transfer(&f.alice, f.bob.address(), 10, 1);
        assert!(check_transaction(&ok, &f.store).is_ok());

        let stale = Transaction::transfer(&f.alice, f.bob.address(), 10, 0);
        assert!(matches!(
            check_transaction(&stale, &f.store),
            Err(MempoolError::Invalid(TxError::InvalidNonce { expected: 1, got: 0 }))
        ));

        let too_much = Transaction::transfer(&f.alice, f.bob.address(), 101, 1);
        assert!(matches!(
            check_transaction(&too_much, &f.store),
            Err(MempoolError::Invalid(TxError::InsufficientBalance { .. }))
        ));

        let reward = Transaction::reward(&f.alice, 1);
        assert!(matches!(
            check_transaction(&reward, &f.store),
            Err(MempoolError::Invalid(TxError::UnexpectedReward))
        ));
    }

    #[test]
    fn test_block_nonce_run_any_order() {
        let f = fixture();
        let first = Transaction::transfer(&f.alice, f.bob.address(), 10, 1);
        let second = Transaction::transfer(&f.alice, f.bob.address(), 20, 2);
        let block = block_with(&f, vec![second, first]);
        assert!(check_block_transactions(&block, &f.store).is_ok());

        let effects = apply_block(&block, &f.store).unwrap();
        assert_eq!(effects.height, 1);
        let alice = f.store.wallet(&f.alice.address()).unwrap();
        assert_eq!(alice.balance, 70);
        assert_eq!(alice.nonce, 2);
        assert_eq!(f.store.wallet(&f.bob.address()).unwrap().balance, 30);
        assert_eq!(f.store.wallet(&f.proposer.address()).unwrap().balance, 1);
    }

    #[test]
    fn test_block_nonce_gap_rejected() {
        let f = fixture();
        let skip = Transaction::transfer(&f.alice, f.bob.address(), 10, 2);
        let block = block_with(&f, vec![skip]);
        assert!(matches!(
            check_block_transactions(&block, &f.store),
            Err(BlockError::Sender {
                source: TxError::InvalidNonce { expected: 1, got: 2 },
                ..
            })
        ));
    }

    #[test]
    fn test_block_overspend_rejected() {
        let f = fixture();
        let a = Transaction::transfer(&f.alice, f.bob.address(), 60, 1);
        let b = Transaction::transfer(&f.alice, f.bob.address(), 60, 2);
        let block = block_with(&f, vec![a, b]);
        assert!(matches!(
            check_block_transactions(&block, &f.store),
            Err(BlockError::Sender {
                source: TxError::InsufficientBalance { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_reward_rules() {
        let f = fixture();
        let parent = f.store.tip().unwrap();

        let no_reward = Block::new(&parent, 0, f.proposer.address(), vec![]).seal(&f.proposer);
        assert_eq!(
            check_block_transactions(&no_reward, &f.store),
            Err(BlockError::RewardCount(0))
        );

        let stolen = Block::new(
            &parent,
            0,
            f.proposer.address(),
            vec![Transaction::reward(&f.alice, 1)],
        )
        .seal(&f.proposer);
        assert!(matches!(
            check_block_transactions(&stolen, &f.store),
            Err(BlockError::RewardRecipient { .. })
        ));

        let mut inflated = Transaction::reward(&f.proposer, 1);
        inflated.amount = 50;
        inflated.sign(&f.proposer);
        let greedy =
            Block::new(&parent, 0, f.proposer.address(), vec![inflated]).seal(&f.proposer);
        assert!(matches!(
            check_block_transactions(&greedy, &f.store),
            Err(BlockError::Sender {
                source: TxError::InvalidRewardAmount { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_stake_accumulates() {
        let f = fixture();
        // Genesis used the proposer's first nonce
        let deposit = Transaction::stake(&f.proposer, 4, 2);
        let block = block_with(&f, vec![deposit]);
        check_block_transactions(&block, &f.store).unwrap();
        let effects = apply_block(&block, &f.store).unwrap();

        assert_eq!(effects.stake_deposited, 4);
        let validator = f.store.validator(&f.proposer.address()).unwrap().unwrap();
        assert_eq!(validator.stake, 5);
        assert_eq!(f.store.wallet(&f.proposer.address()).unwrap().nonce, 2);
    }

    #[test]
    fn test_committed_deposit_cannot_be_replayed() {
        let f = fixture();
        let deposit = Transaction::stake(&f.alice, 4, 1);
        check_transaction(&deposit, &f.store).unwrap();
        apply_block(&block_with(&f, vec![deposit.clone()]), &f.store).unwrap();
        assert_eq!(f.store.validator(&f.alice.address()).unwrap().unwrap().stake, 4);

        assert!(matches!(
            check_transaction(&deposit, &f.store),
            Err(MempoolError::Invalid(TxError::InvalidNonce { expected: 2, got: 1 }))
        ));
        let replay = block_with(&f, vec![deposit]);
        assert!(matches!(
            check_block_transactions(&replay, &f.store),
            Err(BlockError::Sender {
                source: TxError::InvalidNonce { expected: 2, got: 1 },
                ..
            })
        ));
        assert_eq!(f.store.validator(&f.alice.address()).unwrap().unwrap().stake, 4);
        // Deposits move no coins
        assert_eq!(f.store.wallet(&f.alice.address()).unwrap().balance, 100);
    }

    #[test]
    fn test_deposit_past_stake_cap_rejected() {
        let f = fixture();
        let whale = Transaction::stake(&f.alice, u64::MAX, 1);
        assert!(matches!(
            check_transaction(&whale, &f.store),
            Err(MempoolError::Invalid(TxError::Overflow))
        ));
        let block = block_with(&f, vec![whale]);
        assert!(matches!(
            check_block_transactions(&block, &f.store),
            Err(BlockError::Sender {
                source: TxError::Overflow,
                ..
            })
        ));

        // Exactly filling the cap is fine
        let max = Transaction::stake(&f.alice, u64::MAX - 1, 1);
        let block = block_with(&f, vec![max]);
        check_block_transactions(&block, &f.store).unwrap();
        apply_block(&block, &f.store).unwrap();
        assert_eq!(f.store.total_stake().unwrap(), u64::MAX);
    }

    #[test]
    fn test_duplicate_apply_is_refused() {
        let f = fixture();
        let tx = Transaction::transfer(&f.alice, f.bob.address(), 10, 1);
        let block = block_with(&f, vec![tx]);
        apply_block(&block, &f.store).unwrap();
        let before = f.store.wallet(&f.bob.address()).unwrap();

        assert!(matches!(
            apply_block(&block, &f.store),
            Err(StoreError::AlreadyApplied { height: 1, tip: 1 })
        ));
        assert_eq!(f.store.wallet(&f.bob.address()).unwrap(), before);
    }
}
