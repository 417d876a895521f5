//! Proposer selection and vote collection
//!
//! Selection is stake-weighted: the seed's BLAKE3 digest, read as a
//! big-endian integer, is reduced modulo total stake and the validator whose
//! cumulative stake range contains the result proposes.

use crate::error::{CommitError, ProposerError, ValidationError};
use crate::message::BlockVote;
use crate::types::{Quorum, RoundState};
use pos_chain::{stake_total, Address, Block, Commit, Hash, Validator, Vote};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Pick the proposer for `seed` from `validators`.
///
/// Pure: the same seed and validator set always give the same address,
/// whatever order the set is passed in.
pub fn select_proposer(seed: &Hash, validators: &[Validator]) -> Result<Address, ProposerError> {
    let mut ordered: Vec<&Validator> = validators.iter().collect();
    ordered.sort_by(|a, b| a.address.cmp(&b.address));
    let first = ordered.first().ok_or(ProposerError::NoValidators)?;

    let total = stake_total(validators).ok_or(ProposerError::StakeOverflow)?;
    if total == 0 {
        return Ok(first.address);
    }

    let digest = blake3::hash(seed.as_bytes());
    let target = digest
        .as_bytes()
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + *byte as u128) % total as u128) as u64;

    // Partial sums are bounded by `total`
    let mut cumulative: u64 = 0;
    for validator in &ordered {
        cumulative += validator.stake;
        if cumulative > target {
            return Ok(validator.address);
        }
    }
    Ok(first.address)
}

/// Selection seed for `round` on top of a block with hash `prev_hash`.
/// Round 0 uses the hash itself.
pub fn round_seed(prev_hash: &Hash, round: u32) -> Hash {
    if round == 0 {
        return *prev_hash;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&round.to_be_bytes());
    Hash(*hasher.finalize().as_bytes())
}

/// Round state for the block after `parent`
pub fn round_state(
    parent: &Block,
    round: u32,
    validators: &[Validator],
) -> Result<RoundState, ProposerError> {
    let proposer = select_proposer(&round_seed(&parent.hash, round), validators)?;
    Ok(RoundState {
        height: parent.height + 1,
        round,
        proposer,
    })
}

/// Votes gathered for one proposed block
pub struct VoteTally {
    block: Block,
    block_bytes: Vec<u8>,
    stakes: HashMap<Address, u64>,
    total_stake: u64,
    voted_stake: u64,
    votes: Vec<Vote>,
}

impl VoteTally {
    pub fn new(block: Block, validators: &[Validator]) -> Result<Self, ProposerError> {
        let stakes: HashMap<Address, u64> =
            validators.iter().map(|v| (v.address, v.stake)).collect();
        let total_stake = stake_total(validators).ok_or(ProposerError::StakeOverflow)?;
        let block_bytes = block.signing_bytes();
        Ok(Self {
            block,
            block_bytes,
            stakes,
            total_stake,
            voted_stake: 0,
            votes: Vec::new(),
        })
    }

    /// Count a vote. Returns false for votes that do not count: wrong block,
    /// bad signature, non-validator, or a repeat voter.
    pub fn add(&mut self, vote: Vote) -> bool {
        let Some(stake) = self.stakes.get(&vote.voter).copied() else {
            tracing::warn!("Ignoring vote from non-validator {}", vote.voter.short());
            return false;
        };
        if self.votes.iter().any(|v| v.voter == vote.voter) {
            return false;
        }
        if !vote.verify_bytes(&self.block_bytes) {
            tracing::warn!("Ignoring vote with bad signature from {}", vote.voter.short());
            return false;
        }
        // Distinct voters from the set, so this stays within total_stake
        self.voted_stake += stake;
        self.votes.push(vote);
        true
    }

    pub fn reached(&self, quorum: Quorum) -> bool {
        quorum.reached(self.voted_stake, self.total_stake)
    }

    pub fn voted_stake(&self) -> u64 {
        self.voted_stake
    }

    pub fn into_commit(self) -> Commit {
        Commit {
            voters: self.votes,
            block: self.block,
        }
    }
}

/// Wait on `votes` until `tally` reaches `quorum` or `timeout` passes.
///
/// Votes for other blocks are discarded.
pub async fn collect_votes(
    mut tally: VoteTally,
    votes: &mut mpsc::Receiver<BlockVote>,
    quorum: Quorum,
    timeout: Duration,
) -> Option<Commit> {
    let deadline = Instant::now() + timeout;
    let block_hash = tally.block.hash;

    while !tally.reached(quorum) {
        match tokio::time::timeout_at(deadline, votes.recv()).await {
            Ok(Some(vote)) => {
                if vote.block_hash != block_hash {
                    tracing::debug!(
                        "Discarding vote for {} at height {} round {}",
                        vote.block_hash,
                        vote.height,
                        vote.round
                    );
                    continue;
                }
                if tally.add(vote.vote) {
                    tracing::debug!(
                        "Vote stake {}/{} for block {}",
                        tally.voted_stake,
                        tally.total_stake,
                        tally.block.height
                    );
                }
            }
            Ok(None) => return None,
            Err(_) => {
                tracing::warn!(
                    "Vote collection for block {} timed out with {}/{} stake",
                    tally.block.height,
                    tally.voted_stake,
                    tally.total_stake
                );
                return None;
            }
        }
    }

    Some(tally.into_commit())
}

/// Check a commit's votes against the validator set: every voter staked,
/// distinct, signed the block, and together they hold a quorum
pub fn verify_commit(
    commit: &Commit,
    validators: &[Validator],
    quorum: Quorum,
) -> Result<(), CommitError> {
    let stakes: HashMap<Address, u64> = validators.iter().map(|v| (v.address, v.stake)).collect();
    let total = stake_total(validators)
        .ok_or(ValidationError::Proposer(ProposerError::StakeOverflow))?;
    let block_bytes = commit.block.signing_bytes();

    let mut seen = HashSet::new();
    let mut voted: u64 = 0;
    for vote in &commit.voters {
        let stake = stakes
            .get(&vote.voter)
            .copied()
            .ok_or(CommitError::UnknownVoter(vote.voter))?;
        if !seen.insert(vote.voter) {
            return Err(CommitError::DuplicateVoter(vote.voter));
        }
        if !vote.verify_bytes(&block_bytes) {
            return Err(CommitError::InvalidVote(vote.voter));
        }
        voted += stake;
    }

    if !quorum.reached(voted, total) {
        return Err(CommitError::InsufficientStake { voted, total });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pos_chain::{Keypair, Signature, Transaction};

    fn validators(stakes: &[u64]) -> (Vec<Keypair>, Vec<Validator>) {
        let keys: Vec<Keypair> = (0..stakes.len())
            .map(|i| Keypair::from_seed([i as u8 + 1; 32]))
            .collect();
        let set = keys
            .iter()
            .zip(stakes)
            .map(|(k, stake)| Validator {
                address: k.address(),
                stake: *stake,
            })
            .collect();
        (keys, set)
    }

    fn proposal(proposer: &Keypair) -> Block {
        let parent = Block {
            height: 0,
            round: 0,
            timestamp: 0,
            prev_hash: Hash::default(),
            hash: Hash([3u8; 32]),
            proposer: Address::default(),
            signature: Signature::EMPTY,
            transactions: vec![],
        };
        Block::new(&parent, 0, proposer.address(), vec![Transaction::reward(proposer, 1)])
            .seal(proposer)
    }

    #[test]
    fn test_selection_is_pure() {
        let (_, set) = validators(&[1, 1, 1]);
        let seed = Hash([42u8; 32]);
        let first = select_proposer(&seed, &set).unwrap();
        for _ in 0..10 {
            assert_eq!(select_proposer(&seed, &set).unwrap(), first);
        }

        let mut reversed = set.clone();
        reversed.reverse();
        assert_eq!(select_proposer(&seed, &reversed).unwrap(), first);
    }

    #[test]
    fn test_selection_edge_cases() {
        assert_eq!(
            select_proposer(&Hash::default(), &[]),
            Err(ProposerError::NoValidators)
        );

        let (_, mut set) = validators(&[0, 0]);
        set.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(
            select_proposer(&Hash([1u8; 32]), &set).unwrap(),
            set[0].address
        );
    }

    #[test]
    fn test_selection_follows_stake() {
        let (_, set) = validators(&[1, 0, 1000]);
        let heavy = set[2].address;
        let picks = (0..200u8)
            .filter(|i| select_proposer(&Hash([*i; 32]), &set).unwrap() == heavy)
            .count();
        assert!(picks > 190);
        assert!((0..200u8).all(|i| select_proposer(&Hash([i; 32]), &set).unwrap() != set[1].address));
    }

    #[test]
    fn test_round_seed_changes_with_round() {
        let prev = Hash([9u8; 32]);
        assert_eq!(round_seed(&prev, 0), prev);
        assert_ne!(round_seed(&prev, 1), prev);
        assert_ne!(round_seed(&prev, 1), round_seed(&prev, 2));
    }

    #[test]
    fn test_tally_counts_each_validator_once() {
        let (keys, set) = validators(&[1, 1, 1]);
        let block = proposal(&keys[0]);
        let mut tally = VoteTally::new(block.clone(), &set).unwrap();

        assert!(tally.add(Vote::cast(&block, &keys[0])));
        assert!(!tally.add(Vote::cast(&block, &keys[0])));
        assert!(!tally.reached(Quorum::TWO_THIRDS));

        let outsider = Keypair::from_seed([99u8; 32]);
        assert!(!tally.add(Vote::cast(&block, &outsider)));

        let mut other = block.clone();
        other.timestamp += 1;
        assert!(!tally.add(Vote::cast(&other, &keys[1])));

        assert!(tally.add(Vote::cast(&block, &keys[1])));
        assert!(tally.reached(Quorum::TWO_THIRDS));
        assert!(!tally.reached(Quorum::UNANIMOUS));
        assert_eq!(tally.into_commit().voters.len(), 2);
    }

    #[tokio::test]
    async fn test_collect_votes_reaches_quorum() {
        let (keys, set) = validators(&[1, 1, 1]);
        let block = proposal(&keys[0]);
        let (tx, mut rx) = mpsc::channel(16);
        for key in &keys[1..] {
            tx.send(BlockVote {
                height: 1,
                round: 0,
                block_hash: block.hash,
                vote: Vote::cast(&block, key),
            })
            .await
            .unwrap();
        }

        let tally = VoteTally::new(block.clone(), &set).unwrap();
        let commit = collect_votes(tally, &mut rx, Quorum::UNANIMOUS, Duration::from_secs(1)).await;
        assert!(commit.is_none());

        for key in &keys {
            tx.send(BlockVote {
                height: 1,
                round: 0,
                block_hash: block.hash,
                vote: Vote::cast(&block, key),
            })
            .await
            .unwrap();
        }
        let tally = VoteTally::new(block.clone(), &set).unwrap();
        let commit = collect_votes(tally, &mut rx, Quorum::UNANIMOUS, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(commit.voters.len(), 3);
        assert!(verify_commit(&commit, &set, Quorum::UNANIMOUS).is_ok());
    }

    #[tokio::test]
    async fn test_collect_votes_times_out() {
        let (keys, set) = validators(&[1, 1, 1]);
        let block = proposal(&keys[0]);
        let (_tx, mut rx) = mpsc::channel(16);
        let tally = VoteTally::new(block, &set).unwrap();
        let commit =
            collect_votes(tally, &mut rx, Quorum::TWO_THIRDS, Duration::from_millis(20)).await;
        assert!(commit.is_none());
    }

    #[test]
    fn test_verify_commit_rejects_bad_votes() {
        let (keys, set) = validators(&[1, 1, 1]);
        let block = proposal(&keys[0]);
        let votes = |ks: &[&Keypair]| Commit {
            voters: ks.iter().map(|k| Vote::cast(&block, k)).collect(),
            block: block.clone(),
        };

        assert!(verify_commit(&votes(&[&keys[0], &keys[1]]), &set, Quorum::TWO_THIRDS).is_ok());
        assert!(matches!(
            verify_commit(&votes(&[&keys[0]]), &set, Quorum::TWO_THIRDS),
            Err(CommitError::InsufficientStake { voted: 1, total: 3 })
        ));
        assert!(matches!(
            verify_commit(&votes(&[&keys[0], &keys[0]]), &set, Quorum::TWO_THIRDS),
            Err(CommitError::DuplicateVoter(_))
        ));
        let outsider = Keypair::from_seed([99u8; 32]);
        assert!(matches!(
            verify_commit(&votes(&[&keys[0], &outsider]), &set, Quorum::TWO_THIRDS),
            Err(CommitError::UnknownVoter(_))
        ));

        let mut forged = votes(&[&keys[0], &keys[1]]);
        forged.voters[1].signature = forged.voters[0].signature;
        assert!(matches!(
            verify_commit(&forged, &set, Quorum::TWO_THIRDS),
            Err(CommitError::InvalidVote(_))
        ));
    }

    #[test]
    fn test_stake_totals_near_u64_max() {
        let (keys, set) = validators(&[u64::MAX - 1, 1]);
        let block = proposal(&keys[0]);
        let pick = select_proposer(&Hash([3u8; 32]), &set).unwrap();
        assert!(set.iter().any(|v| v.address == pick));

        let mut tally = VoteTally::new(block.clone(), &set).unwrap();
        assert!(tally.add(Vote::cast(&block, &keys[0])));
        assert_eq!(tally.voted_stake(), u64::MAX - 1);
        assert!(tally.reached(Quorum::TWO_THIRDS));
        assert!(!tally.reached(Quorum::UNANIMOUS));
        let commit = tally.into_commit();
        assert!(verify_commit(&commit, &set, Quorum::TWO_THIRDS).is_ok());

        // One past the cap is refused everywhere rather than saturated
        let (_, over) = validators(&[u64::MAX, 1]);
        assert_eq!(
            select_proposer(&Hash([3u8; 32]), &over),
            Err(ProposerError::StakeOverflow)
        );
        assert!(matches!(
            VoteTally::new(block.clone(), &over),
            Err(ProposerError::StakeOverflow)
        ));
        assert!(matches!(
            verify_commit(&commit, &over, Quorum::TWO_THIRDS),
            Err(CommitError::Validation(ValidationError::Proposer(
                ProposerError::StakeOverflow
            )))
        ));
    }
}
