//! Message bus abstraction and the in-process implementation
//!
//! Consensus needs two primitives from the network: publish a signed
//! envelope to every peer, and send one envelope to one peer and read one
//! reply. Peer discovery and gossip fan-out live below this trait.

use crate::error::BusError;
use crate::message::Envelope;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Peer identifier as understood by the bus implementation
pub type PeerId = String;

/// Answers direct requests from peers
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `None` means the request is not answered
    async fn handle_request(&self, request: Envelope) -> Option<Envelope>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `envelope` to every peer and to this node's own subscription
    async fn broadcast(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Stream of broadcast envelopes, own broadcasts included
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Send one envelope to `peer` and wait for its single reply
    async fn send_direct(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, BusError>;

    /// Known peers, in the order sync should try them
    fn peers(&self) -> Vec<PeerId>;

    /// Install the handler answering direct requests to this node
    fn serve(&self, handler: Arc<dyn RequestHandler>);
}

const CHANNEL_CAPACITY: usize = 1024;

/// In-process hub connecting [`LocalBus`] members
#[derive(Clone)]
pub struct LocalNetwork {
    hub: broadcast::Sender<Envelope>,
    handlers: Arc<RwLock<BTreeMap<PeerId, Option<Arc<dyn RequestHandler>>>>>,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        let (hub, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            hub,
            handlers: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Attach a member named `id`
    pub fn join(&self, id: impl Into<PeerId>) -> LocalBus {
        let id = id.into();
        self.handlers.write().entry(id.clone()).or_insert(None);
        LocalBus {
            id,
            network: self.clone(),
        }
    }

    /// Detach `id`; direct requests to it fail afterwards
    pub fn leave(&self, id: &str) {
        self.handlers.write().remove(id);
    }
}

/// One member's view of a [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalBus {
    id: PeerId,
    network: LocalNetwork,
}

impl LocalBus {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn broadcast(&self, envelope: Envelope) -> Result<(), BusError> {
        // No subscribers is not an error
        let _ = self.network.hub.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.network.hub.subscribe()
    }

    async fn send_direct(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, BusError> {
        let handler = self
            .network
            .handlers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| BusError::PeerNotFound(peer.clone()))?
            .ok_or_else(|| BusError::NoReply(peer.clone()))?;
        handler
            .handle_request(envelope)
            .await
            .ok_or_else(|| BusError::NoReply(peer.clone()))
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network
            .handlers
            .read()
            .keys()
            .filter(|id| **id != self.id)
            .cloned()
            .collect()
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) {
        self.network
            .handlers
            .write()
            .insert(self.id.clone(), Some(handler));
    }
}
