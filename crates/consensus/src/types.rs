//! Core types for consensus rounds

use pos_chain::{Address, StoreError};
use serde::Serialize;
use std::time::Duration;

/// Fraction of total stake whose votes finalize a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub numerator: u64,
    pub denominator: u64,
}

impl Quorum {
    pub const TWO_THIRDS: Quorum = Quorum {
        numerator: 2,
        denominator: 3,
    };

    /// Every validator must vote
    pub const UNANIMOUS: Quorum = Quorum {
        numerator: 1,
        denominator: 1,
    };

    /// `voted / total >= numerator / denominator`, without division
    pub fn reached(&self, voted: u64, total: u64) -> bool {
        voted as u128 * self.denominator as u128 >= total as u128 * self.numerator as u128
    }
}

impl Default for Quorum {
    fn default() -> Self {
        Self::TWO_THIRDS
    }
}

/// Where the consensus task is within the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Waiting for something to do: a ready mempool (proposer) or a proposal
    Idle,
    /// Assembling and broadcasting a block
    Proposing,
    /// Proposer waiting for quorum
    Voting,
    /// Voted, waiting for the commit
    AwaitingCommit,
    /// Catching up from peers
    Syncing,
}

/// Proposer rotation state for the next block.
///
/// Owned by the consensus task; replaced wholesale when a commit is applied,
/// a round times out, or sync finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoundState {
    /// Height of the block being decided (tip + 1)
    pub height: u64,
    pub round: u32,
    pub proposer: Address,
}

/// Bounded exponential backoff for ledger calls from the consensus task
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl StoreRetry {
    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up
    pub async fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut delay = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        what,
                        attempt,
                        self.attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Configuration for a consensus node
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How often an idle proposer polls the mempool
    pub poll_interval: Duration,
    /// How long a proposer waits for quorum
    pub vote_timeout: Duration,
    /// How long a round may stall before moving to the next proposer
    pub round_timeout: Duration,
    pub quorum: Quorum,
    pub max_txs_per_block: usize,
    pub store_retry: StoreRetry,
    /// Bound on a single direct request to a peer
    pub request_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            vote_timeout: Duration::from_secs(10),
            round_timeout: Duration::from_secs(30),
            quorum: Quorum::default(),
            max_txs_per_block: pos_chain::MAX_TXS_PER_BLOCK,
            store_retry: StoreRetry::default(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Stats about the consensus task, shared with the RPC server
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStats {
    pub phase: Phase,
    pub round: Option<RoundState>,
    pub blocks_committed: u64,
    pub proposals_made: u64,
    pub votes_cast: u64,
    pub rounds_timed_out: u64,
    pub equivocations_seen: u64,
    pub blocks_synced: u64,
}

impl Default for ConsensusStats {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            round: None,
            blocks_committed: 0,
            proposals_made: 0,
            votes_cast: 0,
            rounds_timed_out: 0,
            equivocations_seen: 0,
            blocks_synced: 0,
        }
    }
}
