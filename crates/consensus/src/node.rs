//! Node wiring: the long-lived tasks around the consensus engine
//!
//! - receive task: drains the bus subscription, verifies and classifies
//!   each envelope, and routes it (transactions are admitted on their own
//!   tasks so a slow consensus step never blocks the drain)
//! - submission task: admits API transactions and gossips accepted ones
//! - consensus task: startup sync, then the engine loop

use crate::bus::MessageBus;
use crate::engine::{ConsensusEngine, Inbound};
use crate::message::{BlockVote, Envelope, Message};
use crate::error::SyncError;
use crate::sync::{BlockServer, Syncer};
use crate::types::{ConsensusConfig, ConsensusStats};
use parking_lot::RwLock;
use pos_chain::{Keypair, LedgerStore, Mempool, MempoolError, Signature, Transaction};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

const CHANNEL_CAPACITY: usize = 1024;

/// A transaction handed in by the API, with the channel for its verdict
pub struct Submission {
    pub tx: Transaction,
    pub reply: oneshot::Sender<Result<Signature, String>>,
}

/// Cloneable handle used by the RPC server
#[derive(Clone)]
pub struct NodeHandle {
    submissions: mpsc::Sender<Submission>,
    stats: Arc<RwLock<ConsensusStats>>,
}

impl NodeHandle {
    /// Submit a transaction and wait for accept or reject
    pub async fn submit(&self, tx: Transaction) -> Result<Signature, String> {
        let (reply, verdict) = oneshot::channel();
        self.submissions
            .send(Submission { tx, reply })
            .await
            .map_err(|_| "node is shutting down".to_string())?;
        verdict
            .await
            .map_err(|_| "node is shutting down".to_string())?
    }

    pub fn stats(&self) -> ConsensusStats {
        self.stats.read().clone()
    }
}

pub struct Node {
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    bus: Arc<dyn MessageBus>,
    config: ConsensusConfig,
    stats: Arc<RwLock<ConsensusStats>>,
    submissions_tx: mpsc::Sender<Submission>,
    submissions_rx: mpsc::Receiver<Submission>,
}

impl Node {
    pub fn new(
        keypair: Keypair,
        store: Arc<dyn LedgerStore>,
        mempool: Arc<Mempool>,
        bus: Arc<dyn MessageBus>,
        config: ConsensusConfig,
    ) -> Self {
        let (submissions_tx, submissions_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            keypair,
            store,
            mempool,
            bus,
            config,
            stats: Arc::new(RwLock::new(ConsensusStats::default())),
            submissions_tx,
            submissions_rx,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            submissions: self.submissions_tx.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Run until `shutdown` resolves or consensus hits a fatal storage error
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let Node {
            keypair,
            store,
            mempool,
            bus,
            config,
            stats,
            submissions_tx,
            submissions_rx,
        } = self;
        drop(submissions_tx);

        bus.serve(Arc::new(BlockServer::new(keypair.clone(), store.clone())));

        // Subscribe before sync so nothing broadcast meanwhile is lost
        let subscription = bus.subscribe();
        let (consensus_tx, consensus_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (votes_tx, votes_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let receive = tokio::spawn(receive_loop(
            subscription,
            store.clone(),
            mempool.clone(),
            consensus_tx,
            votes_tx,
        ));
        let submit = tokio::spawn(submission_loop(
            submissions_rx,
            keypair.clone(),
            store.clone(),
            mempool.clone(),
            bus.clone(),
        ));

        let consensus = run_consensus(
            keypair,
            store,
            mempool,
            bus,
            config,
            stats,
            consensus_rx,
            votes_rx,
        );

        let result = tokio::select! {
            result = consensus => result,
            _ = shutdown => {
                tracing::info!("Shutdown requested");
                Ok(())
            }
        };

        receive.abort();
        submit.abort();
        if let Err(e) = &result {
            tracing::error!("Consensus stopped: {}", e);
        }
        result
    }
}

/// Startup sync, then the engine until it stops
#[allow(clippy::too_many_arguments)]
async fn run_consensus(
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    bus: Arc<dyn MessageBus>,
    config: ConsensusConfig,
    stats: Arc<RwLock<ConsensusStats>>,
    inbound: mpsc::Receiver<Inbound>,
    votes: mpsc::Receiver<BlockVote>,
) -> anyhow::Result<()> {
    let syncer = Syncer::new(
        keypair.clone(),
        store.clone(),
        mempool.clone(),
        bus.clone(),
        config.store_retry,
    );
    match syncer.run().await {
        Ok(outcome) => stats.write().blocks_synced += outcome.applied,
        Err(SyncError::Store(e)) => return Err(e.into()),
        Err(e) => tracing::warn!("Startup sync aborted: {}", e),
    }

    let engine = ConsensusEngine::new(keypair, store, mempool, bus, config, stats)?;
    engine.run(inbound, votes).await
}

async fn receive_loop(
    mut subscription: broadcast::Receiver<Envelope>,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    consensus: mpsc::Sender<Inbound>,
    votes: mpsc::Sender<BlockVote>,
) {
    loop {
        let envelope = match subscription.recv().await {
            Ok(envelope) => envelope,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Receive task lagged, {} messages dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let message = match Message::open(&envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping {} from {}: {}", envelope.kind, envelope.sender.short(), e);
                continue;
            }
        };
        tracing::debug!("Received {} from {}", message.kind(), envelope.sender.short());

        match message {
            Message::NewTransaction(tx) => {
                let store = store.clone();
                let mempool = mempool.clone();
                tokio::spawn(async move {
                    match mempool.admit(tx, store.as_ref()) {
                        Ok(()) => {}
                        Err(MempoolError::Duplicate) => {}
                        Err(e) => tracing::debug!("Gossiped transaction rejected: {}", e),
                    }
                });
            }
            Message::Vote(vote) => {
                if votes.try_send(vote).is_err() {
                    tracing::warn!("Vote channel full, dropping vote");
                }
            }
            message @ (Message::BlockProposal(_) | Message::Commit(_)) => {
                let inbound = Inbound {
                    sender: envelope.sender,
                    message,
                };
                if consensus.try_send(inbound).is_err() {
                    tracing::warn!("Consensus channel full, dropping message");
                }
            }
            Message::RequestBlock { .. } | Message::ResponseBlock(_) => {
                tracing::debug!("Ignoring broadcast {}", envelope.kind);
            }
        }
    }
}

async fn submission_loop(
    mut submissions: mpsc::Receiver<Submission>,
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    bus: Arc<dyn MessageBus>,
) {
    while let Some(Submission { tx, reply }) = submissions.recv().await {
        let signature = tx.signature;
        let verdict = match mempool.admit(tx.clone(), store.as_ref()) {
            Ok(()) => {
                tracing::info!("Accepted transaction {} from {}", signature, tx.from.short());
                let envelope = Message::NewTransaction(tx).seal(&keypair);
                if let Err(e) = bus.broadcast(envelope).await {
                    tracing::error!("Failed to gossip transaction: {}", e);
                }
                Ok(signature)
            }
            Err(e) => {
                tracing::info!("Rejected transaction {}: {}", signature, e);
                Err(e.to_string())
            }
        };
        let _ = reply.send(verdict);
    }
}
