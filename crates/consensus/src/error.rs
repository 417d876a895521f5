//! Consensus, transport and sync errors

use pos_chain::{Address, BlockError, StoreError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposerError {
    #[error("validator set is empty")]
    NoValidators,

    #[error("validator stakes sum past {}", u64::MAX)]
    StakeOverflow,
}

/// Envelope verification and decoding failures
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("envelope signature does not verify against sender {0}")]
    InvalidSignature(Address),

    #[error("malformed payload: {0}")]
    Decode(#[from] borsh::io::Error),

    #[error("expected {expected} message, got {got}")]
    UnexpectedKind { expected: String, got: String },
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("unknown peer {0}")]
    PeerNotFound(String),

    #[error("peer {0} sent no reply")]
    NoReply(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Why a proposed or synced block is not accepted
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("block {height} proposed by {got}, expected {expected}")]
    WrongProposer {
        height: u64,
        expected: Address,
        got: Address,
    },

    #[error("block {height} is ahead of local tip {tip}")]
    NeedSync { height: u64, tip: u64 },

    #[error("block {height} is not above local tip {tip}")]
    Stale { height: u64, tip: u64 },

    #[error("block {height} does not link to the local tip")]
    ParentMismatch { height: u64 },

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Proposer(#[from] ProposerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a commit is not applied
#[derive(Error, Debug)]
pub enum CommitError {
    #[error("vote from {0} is not from a validator")]
    UnknownVoter(Address),

    #[error("vote from {0} does not verify against the block")]
    InvalidVote(Address),

    #[error("validator {0} voted twice")]
    DuplicateVoter(Address),

    #[error("voters hold {voted} of {total} stake, below quorum")]
    InsufficientStake { voted: u64, total: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("no peer answered block request for height {0}")]
    Unreachable(u64),

    #[error("peer {peer} sent an invalid block: {source}")]
    Invalid {
        peer: String,
        #[source]
        source: ValidationError,
    },

    #[error("peer {peer} sent block {got} for height {requested}")]
    UnexpectedHeight {
        peer: String,
        requested: u64,
        got: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
