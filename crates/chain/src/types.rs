//! Core chain types and their canonical encoding

use crate::crypto::{self, Keypair};
use crate::error::{BlockError, TxError};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Implements base58 `Display`/`FromStr` and string serde for a fixed-size byte newtype
macro_rules! base58_bytes {
    ($name:ident, $len:expr) => {
        impl $name {
            fn named(_s: &str) -> Option<Self> {
                None
            }
        }

        base58_bytes!(@impl $name, $len);
    };
    ($name:ident, $len:expr, named) => {
        base58_bytes!(@impl $name, $len);
    };
    (@impl $name:ident, $len:expr) => {
        impl $name {
            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Parse from a byte slice of the exact length
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if let Some(named) = Self::named(s) {
                    return Ok(named);
                }
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|e| format!("invalid base58: {}", e))?;
                Self::from_slice(&bytes)
                    .ok_or_else(|| format!("expected {} bytes, got {}", $len, bytes.len()))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = <String as Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }
    };
}

/// Account address: an ed25519 public key, or one of the reserved pseudo-addresses
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct Address(pub [u8; 32]);

impl Address {
    /// Recipient of stake deposits
    pub const STAKE: Address = Address::reserved(b"stake");
    /// Source of proposer rewards and genesis grants
    pub const REWARD: Address = Address::reserved(b"reward");

    const fn reserved(name: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        let mut i = 0;
        while i < name.len() {
            bytes[i] = name[i];
            i += 1;
        }
        Self(bytes)
    }

    pub fn is_reserved(&self) -> bool {
        *self == Self::STAKE || *self == Self::REWARD
    }

    fn named(s: &str) -> Option<Self> {
        match s {
            "stake" => Some(Self::STAKE),
            "reward" => Some(Self::REWARD),
            _ => None,
        }
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        let s = self.to_string();
        s.chars().take(8).collect()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::STAKE {
            f.write_str("stake")
        } else if *self == Self::REWARD {
            f.write_str("reward")
        } else {
            f.write_str(&bs58::encode(self.0).into_string())
        }
    }
}

base58_bytes!(Address, 32, named);

/// BLAKE3 content hash
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

base58_bytes!(Hash, 32);

/// ed25519 signature bytes
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Placeholder carried by unsigned entities (genesis)
    pub const EMPTY: Signature = Signature([0u8; 64]);
}

impl Default for Signature {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

base58_bytes!(Signature, 64);

/// Unsigned transaction fields, in canonical order
#[derive(BorshSerialize)]
struct TransactionBody {
    from: Address,
    to: Address,
    amount: u64,
    timestamp: i64,
    nonce: u64,
}

/// A value transfer, stake deposit or proposer reward
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender (or `reward` for proposer rewards and genesis grants)
    pub from: Address,
    /// Recipient (or `stake` for stake deposits)
    pub to: Address,
    pub amount: u64,
    /// Unix millis
    pub timestamp: i64,
    /// Sender-scoped sequence number, wallet nonce + 1
    pub nonce: u64,
    pub signature: Signature,
}

impl Transaction {
    /// Create an unsigned transfer stamped with the current time
    pub fn new(from: Address, to: Address, amount: u64, nonce: u64) -> Self {
        Self {
            from,
            to,
            amount,
            timestamp: crate::now_millis(),
            nonce,
            signature: Signature::EMPTY,
        }
    }

    /// Build and sign a transfer from the keypair's address
    pub fn transfer(keypair: &Keypair, to: Address, amount: u64, nonce: u64) -> Self {
        let mut tx = Self::new(keypair.address(), to, amount, nonce);
        tx.sign(keypair);
        tx
    }

    /// Build and sign a stake deposit from the keypair's address.
    /// Deposits take the next nonce like any other sender transaction.
    pub fn stake(keypair: &Keypair, amount: u64, nonce: u64) -> Self {
        let mut tx = Self::new(keypair.address(), Address::STAKE, amount, nonce);
        tx.sign(keypair);
        tx
    }

    /// Build the proposer's reward, signed by the proposer
    pub fn reward(proposer: &Keypair, timestamp: i64) -> Self {
        let mut tx = Self {
            from: Address::REWARD,
            to: proposer.address(),
            amount: crate::REWARD_AMOUNT,
            timestamp,
            nonce: 0,
            signature: Signature::EMPTY,
        };
        tx.sign(proposer);
        tx
    }

    pub fn is_reward(&self) -> bool {
        self.from == Address::REWARD
    }

    pub fn is_stake(&self) -> bool {
        self.to == Address::STAKE
    }

    /// What applying this transaction takes from the sender's balance.
    /// Stake deposits move no coins.
    pub fn debit(&self) -> u64 {
        if self.is_stake() {
            0
        } else {
            self.amount
        }
    }

    /// The key whose signature this transaction must carry.
    /// Rewards are signed by the proposer they pay.
    pub fn signer(&self) -> Address {
        if self.is_reward() {
            self.to
        } else {
            self.from
        }
    }

    /// Canonical bytes: every field except the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = TransactionBody {
            from: self.from,
            to: self.to,
            amount: self.amount,
            timestamp: self.timestamp,
            nonce: self.nonce,
        };
        borsh::to_vec(&body).expect("Transaction body serialization should not fail")
    }

    pub fn sign(&mut self, keypair: &Keypair) {
        self.signature = keypair.sign(&self.signing_bytes());
    }

    pub fn verify_signature(&self) -> Result<(), TxError> {
        crypto::verify(&self.signer(), &self.signing_bytes(), &self.signature)
            .map_err(|_| TxError::InvalidSignature)
    }

    /// Content hash of the signed transaction
    pub fn hash(&self) -> Hash {
        crypto::hash(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Transaction serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Block fields covered by the hash and the proposer's signature
#[derive(BorshSerialize)]
struct BlockBody<'a> {
    height: u64,
    round: u32,
    timestamp: i64,
    prev_hash: Hash,
    proposer: Address,
    transactions: &'a [Transaction],
}

/// Block order of transactions: by signature, then by canonical bytes
fn canonical_order(a: &Transaction, b: &Transaction) -> Ordering {
    a.signature
        .cmp(&b.signature)
        .then_with(|| a.signing_bytes().cmp(&b.signing_bytes()))
}

/// A batch of transactions at one height
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Block {
    /// Parent height + 1
    pub height: u64,
    /// Proposer-selection round this block was produced in
    pub round: u32,
    /// Unix millis
    pub timestamp: i64,
    pub prev_hash: Hash,
    /// Hash of the canonical bytes
    pub hash: Hash,
    pub proposer: Address,
    /// Proposer's signature over the canonical bytes
    pub signature: Signature,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create an unsealed block on top of `parent`
    pub fn new(parent: &Block, round: u32, proposer: Address, transactions: Vec<Transaction>) -> Self {
        Self {
            height: parent.height + 1,
            round,
            timestamp: crate::now_millis(),
            prev_hash: parent.hash,
            hash: Hash::default(),
            proposer,
            signature: Signature::EMPTY,
            transactions,
        }
    }

    /// Sort transactions by signature bytes; ties (unsigned genesis entries)
    /// fall back to the canonical transaction bytes
    pub fn sort_transactions(&mut self) {
        self.transactions.sort_by(canonical_order);
    }

    /// Canonical bytes: every field except hash and signature, transactions sorted
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut sorted = self.transactions.clone();
        sorted.sort_by(canonical_order);
        let body = BlockBody {
            height: self.height,
            round: self.round,
            timestamp: self.timestamp,
            prev_hash: self.prev_hash,
            proposer: self.proposer,
            transactions: &sorted,
        };
        borsh::to_vec(&body).expect("Block body serialization should not fail")
    }

    pub fn compute_hash(&self) -> Hash {
        crypto::hash(&self.signing_bytes())
    }

    /// Sort, sign and hash. The keypair must belong to `proposer`.
    pub fn seal(mut self, keypair: &Keypair) -> Self {
        self.sort_transactions();
        let bytes = self.signing_bytes();
        self.signature = keypair.sign(&bytes);
        self.hash = crypto::hash(&bytes);
        self
    }

    /// Check the proposer's signature and the content hash
    pub fn verify_signature(&self) -> Result<(), BlockError> {
        let bytes = self.signing_bytes();
        crypto::verify(&self.proposer, &bytes, &self.signature)
            .map_err(|_| BlockError::InvalidSignature(self.proposer))?;
        if crypto::hash(&bytes) != self.hash {
            return Err(BlockError::HashMismatch);
        }
        Ok(())
    }

    /// Check every transaction's signature
    pub fn verify_transactions(&self) -> Result<(), BlockError> {
        for (index, tx) in self.transactions.iter().enumerate() {
            tx.verify_signature()
                .map_err(|source| BlockError::Transaction { index, source })?;
        }
        Ok(())
    }

    pub fn rewards(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter().filter(|tx| tx.is_reward())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Block serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// A staked validator
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    /// Staked amount; selection weight and voting power
    pub stake: u64,
}

/// Sum of the validators' stakes, or None when it does not fit a u64.
/// Deposits that would push the total past u64::MAX are refused, so a
/// ledger's validator set always has a total.
pub fn stake_total(validators: &[Validator]) -> Option<u64> {
    validators
        .iter()
        .try_fold(0u64, |acc, v| acc.checked_add(v.stake))
}

/// Account balance and nonce
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Wallet {
    pub address: Address,
    pub balance: u64,
    /// Nonce of the last applied transaction from this address
    pub nonce: u64,
}

impl Wallet {
    /// The wallet of an address that has never been touched
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
        }
    }
}

/// A validator's signature over a proposed block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Vote {
    pub voter: Address,
    pub signature: Signature,
}

impl Vote {
    /// Sign the block's canonical bytes
    pub fn cast(block: &Block, keypair: &Keypair) -> Self {
        Self {
            voter: keypair.address(),
            signature: keypair.sign(&block.signing_bytes()),
        }
    }

    pub fn verify(&self, block: &Block) -> bool {
        self.verify_bytes(&block.signing_bytes())
    }

    /// Verify against pre-computed block bytes
    pub fn verify_bytes(&self, block_bytes: &[u8]) -> bool {
        crypto::verify(&self.voter, block_bytes, &self.signature).is_ok()
    }
}

/// A block sealed by the votes that finalized it
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Commit {
    pub voters: Vec<Vote>,
    pub block: Block,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(keypair: &Keypair) -> Block {
        let alice = Keypair::from_seed([1u8; 32]);
        let bob = Keypair::from_seed([2u8; 32]);
        let parent = Block {
            height: 4,
            round: 0,
            timestamp: 0,
            prev_hash: Hash::default(),
            hash: Hash([9u8; 32]),
            proposer: Address::default(),
            signature: Signature::EMPTY,
            transactions: vec![],
        };
        let txs = vec![
            Transaction::transfer(&alice, bob.address(), 5, 1),
            Transaction::transfer(&bob, alice.address(), 3, 1),
            Transaction::reward(keypair, 7),
        ];
        Block::new(&parent, 0, keypair.address(), txs).seal(keypair)
    }

    #[test]
    fn test_reserved_addresses_display() {
        assert_eq!(Address::STAKE.to_string(), "stake");
        assert_eq!(Address::REWARD.to_string(), "reward");
        assert!(Address::STAKE.is_reserved());
        assert!(!Keypair::from_seed([3u8; 32]).address().is_reserved());
    }

    #[test]
    fn test_address_base58_roundtrip() {
        let address = Keypair::from_seed([3u8; 32]).address();
        let parsed: Address = address.to_string().parse().unwrap();
        assert_eq!(parsed, address);
        assert!("not-base58-0OIl".parse::<Address>().is_err());
        assert_eq!("stake".parse::<Address>().unwrap(), Address::STAKE);
    }

    #[test]
    fn test_json_uses_base58_strings() {
        let proposer = Keypair::from_seed([5u8; 32]);
        let block = sample_block(&proposer);

        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["hash"], serde_json::json!(block.hash.to_string()));
        assert_eq!(json["proposer"], serde_json::json!(proposer.address().to_string()));
        assert!(json["transactions"][0]["signature"].is_string());

        let decoded: Block = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, block);
        assert!(serde_json::from_str::<Hash>("\"0OIl\"").is_err());
    }

    #[test]
    fn test_transaction_signature() {
        let alice = Keypair::from_seed([1u8; 32]);
        let mut tx = Transaction::transfer(&alice, Address::STAKE, 10, 0);
        assert!(tx.verify_signature().is_ok());

        tx.amount = 11;
        assert_eq!(tx.verify_signature(), Err(TxError::InvalidSignature));
    }

    #[test]
    fn test_reward_signed_by_recipient() {
        let proposer = Keypair::from_seed([4u8; 32]);
        let reward = Transaction::reward(&proposer, 1);
        assert!(reward.is_reward());
        assert_eq!(reward.signer(), proposer.address());
        assert!(reward.verify_signature().is_ok());
    }

    #[test]
    fn test_block_hash_ignores_insertion_order() {
        let proposer = Keypair::from_seed([5u8; 32]);
        let block = sample_block(&proposer);

        let mut shuffled = block.clone();
        shuffled.transactions.reverse();
        assert_eq!(shuffled.compute_hash(), block.hash);
        assert!(shuffled.verify_signature().is_ok());
    }

    #[test]
    fn test_sealed_order_matches_signing_order() {
        let proposer = Keypair::from_seed([5u8; 32]);
        let block = sample_block(&proposer);
        assert!(block
            .transactions
            .windows(2)
            .all(|pair| canonical_order(&pair[0], &pair[1]).is_le()));

        let mut resorted = block.clone();
        resorted.transactions.rotate_left(1);
        resorted.sort_transactions();
        assert_eq!(resorted.transactions, block.transactions);
    }

    #[test]
    fn test_block_tamper_detection() {
        let proposer = Keypair::from_seed([5u8; 32]);
        let block = sample_block(&proposer);
        assert!(block.verify_signature().is_ok());

        let mut bad_height = block.clone();
        bad_height.height += 1;
        assert!(bad_height.verify_signature().is_err());

        let mut bad_proposer = block.clone();
        bad_proposer.proposer.0[0] ^= 1;
        assert!(bad_proposer.verify_signature().is_err());

        let mut bad_tx = block.clone();
        bad_tx.transactions[0].amount ^= 1;
        assert!(bad_tx.verify_signature().is_err());

        let mut bad_tx_sig = block.clone();
        bad_tx_sig.transactions[1].signature.0[0] ^= 1;
        assert!(bad_tx_sig.verify_signature().is_err());
    }

    #[test]
    fn test_vote_verifies_against_block() {
        let proposer = Keypair::from_seed([5u8; 32]);
        let voter = Keypair::from_seed([6u8; 32]);
        let block = sample_block(&proposer);
        let vote = Vote::cast(&block, &voter);
        assert!(vote.verify(&block));

        let mut other = block.clone();
        other.timestamp += 1;
        assert!(!vote.verify(&other));
    }
}
