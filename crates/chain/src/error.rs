//! Chain errors

use crate::types::Address;
use thiserror::Error;

/// Reasons a single transaction is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("signature does not verify against the sender")]
    InvalidSignature,

    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("insufficient balance: has {balance}, needs {needed}")]
    InsufficientBalance { balance: u64, needed: u64 },

    #[error("reward transactions are created by block proposers only")]
    UnexpectedReward,

    #[error("reward amount must be {expected}, got {got}")]
    InvalidRewardAmount { expected: u64, got: u64 },

    #[error("cannot send to reserved address {0}")]
    ReservedRecipient(Address),

    #[error("arithmetic overflow")]
    Overflow,
}

/// Reasons a block fails validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block signature does not verify against proposer {0}")]
    InvalidSignature(Address),

    #[error("block hash does not match its contents")]
    HashMismatch,

    #[error("transaction {index} invalid: {source}")]
    Transaction {
        index: usize,
        #[source]
        source: TxError,
    },

    #[error("block must carry exactly one reward transaction, found {0}")]
    RewardCount(usize),

    #[error("reward paid to {paid}, proposer is {proposer}")]
    RewardRecipient { paid: Address, proposer: Address },

    #[error("sender {sender}: {source}")]
    Sender {
        sender: Address,
        #[source]
        source: TxError,
    },

    #[error("storage error while validating: {0}")]
    Store(String),
}

/// Ledger state store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("ledger has no genesis block")]
    Empty,

    #[error("block {height} already applied (tip is {tip})")]
    AlreadyApplied { height: u64, tip: u64 },

    #[error("block {height} does not extend tip {tip}")]
    HeightGap { height: u64, tip: u64 },

    #[error("storage transaction aborted")]
    Aborted,

    #[error("total stake exceeds {}", u64::MAX)]
    StakeOverflow,
}

impl StoreError {
    /// Failures of the storage engine itself, which may clear on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Sled(_) | StoreError::Aborted)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<StoreError> for BlockError {
    fn from(e: StoreError) -> Self {
        BlockError::Store(e.to_string())
    }
}

/// Mempool rejections, surfaced to submitters as the reason string
#[derive(Error, Debug)]
pub enum MempoolError {
    #[error("mempool is full")]
    Full,

    #[error("transaction already pending")]
    Duplicate,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid transaction: {0}")]
    Invalid(#[from] TxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
