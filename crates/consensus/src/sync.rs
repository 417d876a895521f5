//! Chain sync: point-to-point catch-up with peers
//!
//! The requesting side asks peers for `tip + 1` one block at a time and runs
//! every reply through the same validation as live proposals. The serving
//! side answers with the requested block, or its tip when asked past it.

use crate::bus::{MessageBus, PeerId, RequestHandler};
use crate::error::{EnvelopeError, SyncError, ValidationError};
use crate::message::{Envelope, Message, MessageKind};
use crate::types::StoreRetry;
use crate::validator::validate_block;
use async_trait::async_trait;
use pos_chain::{processor, Block, Keypair, LedgerStore, Mempool};
use std::sync::Arc;

/// Result of a completed sync run
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub tip: Block,
    pub applied: u64,
}

pub struct Syncer {
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
    mempool: Arc<Mempool>,
    bus: Arc<dyn MessageBus>,
    retry: StoreRetry,
}

impl Syncer {
    pub fn new(
        keypair: Keypair,
        store: Arc<dyn LedgerStore>,
        mempool: Arc<Mempool>,
        bus: Arc<dyn MessageBus>,
        retry: StoreRetry,
    ) -> Self {
        Self {
            keypair,
            store,
            mempool,
            bus,
            retry,
        }
    }

    /// Fetch and apply blocks until a peer reports nothing newer.
    ///
    /// An empty ledger adopts the first peer's genesis block.
    pub async fn run(&self) -> Result<SyncOutcome, SyncError> {
        let mut applied = 0;

        loop {
            let store = self.store.as_ref();
            let tip_height = self.retry.run("read tip", || store.tip_height()).await?;
            let requested = tip_height.map_or(0, |h| h + 1);

            let Some((peer, block)) = self.fetch(requested).await? else {
                let tip = self.retry.run("read tip", || store.tip()).await?;
                tracing::info!("No peers to sync from, staying at height {}", tip.height);
                return Ok(SyncOutcome { tip, applied });
            };

            if block.height < requested {
                let tip = self.retry.run("read tip", || store.tip()).await?;
                tracing::info!(
                    "Sync complete at height {} ({} blocks applied)",
                    tip.height,
                    applied
                );
                return Ok(SyncOutcome { tip, applied });
            }
            if block.height > requested {
                return Err(SyncError::UnexpectedHeight {
                    peer,
                    requested,
                    got: block.height,
                });
            }

            if tip_height.is_none() {
                self.adopt_genesis(&peer, &block)?;
            } else {
                validate_block(&block, store).map_err(|source| SyncError::Invalid {
                    peer: peer.clone(),
                    source,
                })?;
            }

            self.retry
                .run("apply synced block", || processor::apply_block(&block, store))
                .await?;
            self.mempool.remove(&block.transactions);
            applied += 1;
            tracing::debug!("Synced block {} from {}", block.height, peer);
        }
    }

    /// Ask peers in order for the block at `height`; the first usable reply wins
    async fn fetch(&self, height: u64) -> Result<Option<(PeerId, Block)>, SyncError> {
        let peers = self.bus.peers();
        if peers.is_empty() {
            return Ok(None);
        }

        let request = Message::RequestBlock { height }.seal(&self.keypair);
        for peer in peers {
            let reply = match self.bus.send_direct(&peer, request.clone()).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("Block request to {} failed: {}", peer, e);
                    continue;
                }
            };
            match open_response(&reply) {
                Ok(block) => return Ok(Some((peer, block))),
                Err(e) => {
                    tracing::warn!("Bad block response from {}: {}", peer, e);
                }
            }
        }
        Err(SyncError::Unreachable(height))
    }

    fn adopt_genesis(&self, peer: &PeerId, block: &Block) -> Result<(), SyncError> {
        if block.height != 0 || block.hash != block.compute_hash() {
            return Err(SyncError::Invalid {
                peer: peer.clone(),
                source: ValidationError::Block(pos_chain::BlockError::HashMismatch),
            });
        }
        tracing::info!("Adopting genesis {} from {}", block.hash, peer);
        Ok(())
    }
}

fn open_response(envelope: &Envelope) -> Result<Block, EnvelopeError> {
    match Message::open(envelope)? {
        Message::ResponseBlock(block) => Ok(block),
        other => Err(EnvelopeError::UnexpectedKind {
            expected: MessageKind::ResponseBlock.to_string(),
            got: other.kind().to_string(),
        }),
    }
}

/// Serves `RequestBlock` from the local ledger
pub struct BlockServer {
    keypair: Keypair,
    store: Arc<dyn LedgerStore>,
}

impl BlockServer {
    pub fn new(keypair: Keypair, store: Arc<dyn LedgerStore>) -> Self {
        Self { keypair, store }
    }

    fn lookup(&self, height: u64) -> Result<Option<Block>, pos_chain::StoreError> {
        match self.store.get_block(height)? {
            Some(block) => Ok(Some(block)),
            None if self.store.tip_height()?.is_some() => Ok(Some(self.store.tip()?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RequestHandler for BlockServer {
    async fn handle_request(&self, request: Envelope) -> Option<Envelope> {
        let height = match Message::open(&request) {
            Ok(Message::RequestBlock { height }) => height,
            Ok(other) => {
                tracing::debug!("Ignoring direct {} request", other.kind());
                return None;
            }
            Err(e) => {
                tracing::warn!("Dropping bad direct request: {}", e);
                return None;
            }
        };

        match self.lookup(height) {
            Ok(Some(block)) => Some(Message::ResponseBlock(block).seal(&self.keypair)),
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Cannot serve block {}: {}", height, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalNetwork;
    use pos_chain::{GenesisConfig, MemoryLedger};

    #[tokio::test]
    async fn test_server_answers_with_tip_past_the_end() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let genesis = GenesisConfig::new()
            .with_validator(keypair.address(), 1)
            .initialize(store.as_ref())
            .unwrap();
        let server = BlockServer::new(keypair.clone(), store);

        let request = Message::RequestBlock { height: 9 }.seal(&keypair);
        let reply = server.handle_request(request).await.unwrap();
        assert_eq!(open_response(&reply).unwrap(), genesis);

        let wrong = Message::ResponseBlock(genesis).seal(&keypair);
        assert!(server.handle_request(wrong).await.is_none());
    }

    #[tokio::test]
    async fn test_no_peers_is_not_an_error() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        GenesisConfig::new()
            .with_validator(keypair.address(), 1)
            .initialize(store.as_ref())
            .unwrap();
        let network = LocalNetwork::new();
        let syncer = Syncer::new(
            keypair,
            store,
            Arc::new(Mempool::new()),
            Arc::new(network.join("alone")),
            StoreRetry::default(),
        );
        let outcome = syncer.run().await.unwrap();
        assert_eq!(outcome.tip.height, 0);
        assert_eq!(outcome.applied, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peers() {
        let keypair = Keypair::from_seed([1u8; 32]);
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let network = LocalNetwork::new();
        let _silent = network.join("silent");
        let syncer = Syncer::new(
            keypair,
            store,
            Arc::new(Mempool::new()),
            Arc::new(network.join("me")),
            StoreRetry::default(),
        );
        assert!(matches!(syncer.run().await, Err(SyncError::Unreachable(0))));
    }
}
