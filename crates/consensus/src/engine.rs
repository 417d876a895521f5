//! Consensus state machine: propose, vote, commit
//!
//! One task owns the engine. Proposals and commits arrive on the consensus
//! channel; votes arrive on their own channel so the proposer can wait on
//! them while everything else queues. The round state is replaced, never
//! patched, at each commit, round timeout or sync.
//!
//! A node votes for at most one block per height. Once it has voted it is
//! locked on that block: later rounds at the same height get no vote for
//! anything else, and a locked proposer re-proposes the locked block instead
//! of building a new one. A proposal can move a node at most one round ahead,
//! and only after the node's own round has timed out.

use crate::bus::MessageBus;
use crate::error::{CommitError, ValidationError};
use crate::leader::{self, VoteTally};
use crate::message::{BlockVote, Message};
use crate::sync::Syncer;
use crate::types::{ConsensusConfig, ConsensusStats, Phase, RoundState};
use crate::validator::validate_block;
use parking_lot::RwLock;
use pos_chain::{
    processor, Address, Block, BlockProducer, BlockProducerConfig, Commit, Keypair, LedgerStore,
    Mempool, StoreError, Vote,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

/// A proposal or commit together with the envelope sender
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender: Address,
    pub message: Message,
}

pub struct ConsensusEngine {
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    bus: Arc<dyn MessageBus>,
    producer: BlockProducer,
    syncer: Syncer,
    config: ConsensusConfig,
    stats: Arc<RwLock<ConsensusStats>>,

    state: RoundState,
    phase: Phase,
    /// Block voted for at the current height, with our vote for it
    locked: Option<(Block, Vote)>,
    /// Round in which the locked vote was last sent again
    revoted: Option<u32>,
    /// Proposal for the next round, held until the current round times out
    deferred: Option<Block>,
    round_started: Instant,
}

impl ConsensusEngine {
    /// Build an engine positioned at round 0 on top of the current tip
    pub fn new(
        keypair: Keypair,
        store: Arc<dyn LedgerStore>,
        mempool: Arc<Mempool>,
        bus: Arc<dyn MessageBus>,
        config: ConsensusConfig,
        stats: Arc<RwLock<ConsensusStats>>,
    ) -> Result<Self, ValidationError> {
        let tip = store.tip()?;
        let state = leader::round_state(&tip, 0, &store.validators()?)?;
        let producer = BlockProducer::new(
            keypair.clone(),
            mempool.clone(),
            store.clone(),
            BlockProducerConfig {
                max_txs_per_block: config.max_txs_per_block,
            },
        );
        let syncer = Syncer::new(
            keypair.clone(),
            store.clone(),
            mempool.clone(),
            bus.clone(),
            config.store_retry,
        );

        let engine = Self {
            keypair,
            store,
            mempool,
            bus,
            producer,
            syncer,
            config,
            stats,
            state,
            phase: Phase::Idle,
            locked: None,
            revoted: None,
            deferred: None,
            round_started: Instant::now(),
        };
        engine.publish();
        Ok(engine)
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Hash of the block this node is locked on at the current height
    pub fn locked_hash(&self) -> Option<pos_chain::Hash> {
        self.locked.as_ref().map(|(block, _)| block.hash)
    }

    fn is_proposer(&self) -> bool {
        self.state.proposer == self.keypair.address()
    }

    fn publish(&self) {
        let mut stats = self.stats.write();
        stats.phase = self.phase;
        stats.round = Some(self.state);
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.publish();
    }

    /// Drive consensus until the inbound channel closes or a storage
    /// failure outlasts its retries
    pub async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut votes: mpsc::Receiver<BlockVote>,
    ) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            "Consensus started at height {} round {}, proposer {}",
            self.state.height,
            self.state.round,
            self.state.proposer.short()
        );

        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => {
                        self.handle(msg).await?;
                        // A commit or sync may have made this node the proposer
                        if self.phase == Phase::Idle && self.is_proposer() {
                            self.try_propose(&mut votes).await?;
                        }
                    }
                    None => break,
                },
                _ = tick.tick() => self.on_tick(&mut votes).await?,
                Some(vote) = votes.recv() => {
                    tracing::trace!("Ignoring vote for height {} outside collection", vote.height);
                }
            }
        }

        tracing::info!("Consensus stopped at height {}", self.state.height);
        Ok(())
    }

    pub async fn handle(&mut self, msg: Inbound) -> Result<(), StoreError> {
        match msg.message {
            Message::BlockProposal(block) => self.on_proposal(msg.sender, block).await,
            Message::Commit(commit) => self.on_commit(commit).await,
            other => {
                tracing::debug!("Consensus ignoring {} message", other.kind());
                Ok(())
            }
        }
    }

    /// Poll step: propose when selected and idle, and advance the round when
    /// it has stalled
    pub async fn on_tick(&mut self, votes: &mut mpsc::Receiver<BlockVote>) -> Result<(), StoreError> {
        if self.phase == Phase::Idle && self.is_proposer() {
            self.try_propose(votes).await?;
        }

        let armed = self.phase == Phase::AwaitingCommit
            || self.locked.is_some()
            || self.deferred.is_some()
            || !self.mempool.is_empty();
        if !armed {
            self.round_started = Instant::now();
        } else if self.round_started.elapsed() >= self.config.round_timeout {
            self.advance_round().await?;
        }
        Ok(())
    }

    async fn tip(&self) -> Result<Block, StoreError> {
        let store = self.store.as_ref();
        self.config.store_retry.run("read tip", || store.tip()).await
    }

    async fn validators(&self) -> Result<Vec<pos_chain::Validator>, StoreError> {
        let store = self.store.as_ref();
        self.config
            .store_retry
            .run("read validators", || store.validators())
            .await
    }

    async fn try_propose(&mut self, votes: &mut mpsc::Receiver<BlockVote>) -> Result<(), StoreError> {
        let tip = self.tip().await?;
        if tip.height + 1 != self.state.height {
            return Ok(());
        }

        let (block, own_vote) = match self.locked.clone() {
            Some((block, vote)) => {
                self.set_phase(Phase::Proposing);
                tracing::info!(
                    "Re-proposing locked block {} from round {} in round {}",
                    block.height,
                    block.round,
                    self.state.round
                );
                self.stats.write().proposals_made += 1;
                self.broadcast(Message::BlockProposal(block.clone())).await;
                self.revoted = Some(self.state.round);
                (block, vote)
            }
            None => {
                let producer = &self.producer;
                let round = self.state.round;
                let block = match self
                    .config
                    .store_retry
                    .run("assemble block", || producer.try_produce(&tip, round))
                    .await?
                {
                    Some(block) => block,
                    None => return Ok(()),
                };

                self.set_phase(Phase::Proposing);
                tracing::info!(
                    "Proposing block {} round {} with {} txs",
                    block.height,
                    block.round,
                    block.transactions.len()
                );
                self.stats.write().proposals_made += 1;
                self.broadcast(Message::BlockProposal(block.clone())).await;

                let Some(own_vote) = self.vote_for(&block).await? else {
                    self.set_phase(Phase::Idle);
                    return Ok(());
                };
                (block, own_vote)
            }
        };

        self.set_phase(Phase::Voting);
        let validators = self.validators().await?;
        let mut tally = match VoteTally::new(block, &validators) {
            Ok(tally) => tally,
            Err(e) => {
                tracing::error!("Cannot count votes: {}", e);
                self.set_phase(Phase::AwaitingCommit);
                return Ok(());
            }
        };
        tally.add(own_vote);

        match leader::collect_votes(tally, votes, self.config.quorum, self.config.vote_timeout).await {
            Some(commit) => {
                tracing::info!(
                    "Quorum reached for block {} with {} votes",
                    commit.block.height,
                    commit.voters.len()
                );
                self.broadcast(Message::Commit(commit.clone())).await;
                self.on_commit(commit).await?;
            }
            None => {
                // The round timer moves everyone on
                self.set_phase(Phase::AwaitingCommit);
            }
        }
        Ok(())
    }

    async fn on_proposal(&mut self, sender: Address, block: Block) -> Result<(), StoreError> {
        let tip = self.tip().await?;
        if block.height <= tip.height {
            tracing::debug!("Ignoring proposal for committed height {}", block.height);
            return Ok(());
        }
        if block.height > tip.height + 1 {
            tracing::info!(
                "Proposal at height {} while tip is {}, syncing",
                block.height,
                tip.height
            );
            return self.sync().await;
        }

        // The current proposer may re-propose a block from an earlier round
        let reproposal = block.round < self.state.round && sender == self.state.proposer;
        if sender != block.proposer && !reproposal {
            tracing::warn!(
                "Proposal for block {} relayed by {} instead of its proposer",
                block.height,
                sender.short()
            );
            return Ok(());
        }
        if block.round < self.state.round && !reproposal {
            tracing::debug!(
                "Ignoring proposal from earlier round {} (current {})",
                block.round,
                self.state.round
            );
            return Ok(());
        }
        if block.round > self.state.round {
            match self.next_round_for(&tip, &block).await? {
                Some(state) => {
                    tracing::info!(
                        "Moving to round {} at height {} on proposal from {}",
                        block.round,
                        block.height,
                        block.proposer.short()
                    );
                    self.enter_round(state);
                    self.deferred = None;
                }
                None => return Ok(()),
            }
        }

        self.vote_for(&block).await?;
        Ok(())
    }

    /// Round state to jump to for a proposal from a later round, if any.
    ///
    /// Only the next round qualifies, only from that round's proposer, and
    /// only once the current round has run out. A valid proposal that comes
    /// early is held and voted on when the local timer moves us there.
    async fn next_round_for(
        &mut self,
        tip: &Block,
        block: &Block,
    ) -> Result<Option<RoundState>, StoreError> {
        if self.state.round.checked_add(1) != Some(block.round) {
            tracing::debug!(
                "Ignoring proposal for round {} while in round {}",
                block.round,
                self.state.round
            );
            return Ok(None);
        }

        let validators = self.validators().await?;
        let state = match leader::round_state(tip, block.round, &validators) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Cannot select proposer: {}", e);
                return Ok(None);
            }
        };
        if state.proposer != block.proposer {
            tracing::warn!(
                "Ignoring round {} proposal from {}, proposer is {}",
                block.round,
                block.proposer.short(),
                state.proposer.short()
            );
            return Ok(None);
        }

        if self.round_started.elapsed() < self.config.round_timeout {
            if self.deferred.is_none() && block.verify_signature().is_ok() {
                tracing::debug!(
                    "Holding round {} proposal until round {} times out",
                    block.round,
                    self.state.round
                );
                self.deferred = Some(block.clone());
            }
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Validate `block` and, unless this height already has our vote, sign
    /// and broadcast a vote for it. A re-proposal of the locked block gets
    /// the locked vote again, once per round.
    async fn vote_for(&mut self, block: &Block) -> Result<Option<Vote>, StoreError> {
        if let Some((locked, vote)) = &self.locked {
            if locked.hash == block.hash {
                if block.round >= self.state.round || self.revoted == Some(self.state.round) {
                    return Ok(None);
                }
                let vote = vote.clone();
                self.revoted = Some(self.state.round);
                self.send_vote(block, vote.clone()).await;
                if self.phase != Phase::Proposing {
                    self.set_phase(Phase::AwaitingCommit);
                }
                tracing::debug!(
                    "Voted again for locked block {} in round {}",
                    block.height,
                    self.state.round
                );
                return Ok(Some(vote));
            }

            if locked.round == block.round {
                tracing::warn!(
                    "Equivocation by {} at height {} round {}: {} and {}",
                    block.proposer.short(),
                    block.height,
                    block.round,
                    locked.hash,
                    block.hash
                );
                self.stats.write().equivocations_seen += 1;
            } else {
                tracing::info!(
                    "Locked on {} at height {}, not voting for {} from round {}",
                    locked.hash,
                    block.height,
                    block.hash,
                    block.round
                );
            }
            return Ok(None);
        }

        match validate_block(block, self.store.as_ref()) {
            Ok(()) => {}
            Err(ValidationError::NeedSync { .. }) => {
                self.sync().await?;
                return Ok(None);
            }
            Err(ValidationError::Store(e)) => return Err(e),
            Err(e) => {
                tracing::warn!("Rejecting proposal for block {}: {}", block.height, e);
                return Ok(None);
            }
        }

        let vote = Vote::cast(block, &self.keypair);
        self.locked = Some((block.clone(), vote.clone()));
        self.send_vote(block, vote.clone()).await;
        if self.phase != Phase::Proposing {
            self.set_phase(Phase::AwaitingCommit);
        }
        tracing::debug!("Voted for block {} round {}", block.height, block.round);
        Ok(Some(vote))
    }

    async fn send_vote(&self, block: &Block, vote: Vote) {
        self.broadcast(Message::Vote(BlockVote {
            height: block.height,
            round: block.round,
            block_hash: block.hash,
            vote,
        }))
        .await;
        self.stats.write().votes_cast += 1;
    }

    async fn on_commit(&mut self, commit: Commit) -> Result<(), StoreError> {
        let tip = self.tip().await?;
        let height = commit.block.height;
        if height <= tip.height {
            tracing::debug!("Ignoring duplicate commit for height {}", height);
            return Ok(());
        }
        if height > tip.height + 1 {
            tracing::info!("Commit at height {} while tip is {}, syncing", height, tip.height);
            return self.sync().await;
        }

        match self.check_commit(&commit).await {
            Ok(()) => {}
            Err(CommitError::Store(e)) | Err(CommitError::Validation(ValidationError::Store(e))) => {
                return Err(e)
            }
            Err(e) => {
                tracing::warn!("Rejecting commit for block {}: {}", height, e);
                return Ok(());
            }
        }

        let block = commit.block;
        let store = self.store.as_ref();
        match self
            .config
            .store_retry
            .run("apply block", || processor::apply_block(&block, store))
            .await
        {
            Ok(_) => {}
            Err(StoreError::AlreadyApplied { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        self.mempool.remove(&block.transactions);

        tracing::info!(
            "Committed block {} ({}) | {} txs | {} votes",
            block.height,
            block.hash,
            block.transactions.len(),
            commit.voters.len()
        );
        self.stats.write().blocks_committed += 1;

        let validators = self.validators().await?;
        self.clear_height();
        match leader::round_state(&block, 0, &validators) {
            Ok(state) => self.enter_round(state),
            Err(e) => tracing::error!("Cannot select next proposer: {}", e),
        }
        Ok(())
    }

    async fn check_commit(&self, commit: &Commit) -> Result<(), CommitError> {
        let validators = self.validators().await?;
        leader::verify_commit(commit, &validators, self.config.quorum)?;
        validate_block(&commit.block, self.store.as_ref())?;
        Ok(())
    }

    async fn advance_round(&mut self) -> Result<(), StoreError> {
        let Some(next) = self.state.round.checked_add(1) else {
            tracing::error!("Round counter exhausted at height {}", self.state.height);
            self.round_started = Instant::now();
            return Ok(());
        };
        let tip = self.tip().await?;
        let validators = self.validators().await?;
        match leader::round_state(&tip, next, &validators) {
            Ok(state) => {
                tracing::warn!(
                    "Round {} at height {} stalled, moving to round {} with proposer {}",
                    self.state.round,
                    self.state.height,
                    next,
                    state.proposer.short()
                );
                self.stats.write().rounds_timed_out += 1;
                self.enter_round(state);
            }
            Err(e) => {
                tracing::error!("Cannot select proposer for round {}: {}", next, e);
                self.round_started = Instant::now();
                return Ok(());
            }
        }

        if let Some(block) = self.deferred.take() {
            if block.height == self.state.height && block.round == self.state.round {
                self.vote_for(&block).await?;
            }
        }
        Ok(())
    }

    /// Forget per-height voting state after the tip moves
    fn clear_height(&mut self) {
        self.locked = None;
        self.revoted = None;
        self.deferred = None;
    }

    fn enter_round(&mut self, state: RoundState) {
        self.state = state;
        self.phase = Phase::Idle;
        self.round_started = Instant::now();
        self.publish();
    }

    /// Catch up from peers, then restart at round 0 on the new tip.
    /// Sync failures are logged; storage failures are returned.
    pub async fn sync(&mut self) -> Result<(), StoreError> {
        self.set_phase(Phase::Syncing);
        match self.syncer.run().await {
            Ok(outcome) => {
                self.stats.write().blocks_synced += outcome.applied;
            }
            Err(crate::error::SyncError::Store(e)) => return Err(e),
            Err(e) => tracing::warn!("Sync aborted: {}", e),
        }

        let tip = self.tip().await?;
        let validators = self.validators().await?;
        self.clear_height();
        match leader::round_state(&tip, 0, &validators) {
            Ok(state) => self.enter_round(state),
            Err(e) => {
                tracing::error!("Cannot select proposer after sync: {}", e);
                self.set_phase(Phase::Idle);
            }
        }
        Ok(())
    }

    async fn broadcast(&self, message: Message) {
        let kind = message.kind();
        if let Err(e) = self.bus.broadcast(message.seal(&self.keypair)).await {
            tracing::error!("Failed to broadcast {}: {}", kind, e);
        }
    }
}
