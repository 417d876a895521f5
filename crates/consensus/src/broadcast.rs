//! WebSocket message bus
//!
//! Every node listens for WebSocket connections. Broadcasts travel over one
//! long-lived outbound connection per configured peer; a direct request
//! opens its own connection, writes one binary frame and reads one back.

use crate::bus::{MessageBus, PeerId, RequestHandler};
use crate::error::BusError;
use crate::message::Envelope;
use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message as WsMessage};

/// Frames on the wire
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
enum Frame {
    /// Published to every subscriber
    Gossip(Envelope),
    /// Direct request expecting one `Reply`
    Request(Envelope),
    Reply(Option<Envelope>),
}

impl Frame {
    fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Frame serialization should not fail")
    }

    fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

type Handler = Arc<RwLock<Option<Arc<dyn RequestHandler>>>>;

pub struct WsBus {
    /// Inbound gossip, own broadcasts included
    inbound: broadcast::Sender<Envelope>,
    handler: Handler,
    peers: Vec<PeerId>,
    /// Outbound gossip queue per peer
    links: Mutex<HashMap<PeerId, mpsc::Sender<Vec<u8>>>>,
    request_timeout: Duration,
}

impl WsBus {
    /// `peers` are `host:port` addresses of other nodes' listeners
    pub fn new(peers: Vec<PeerId>, request_timeout: Duration) -> Self {
        let (inbound, _) = broadcast::channel(1024);
        Self {
            inbound,
            handler: Arc::new(RwLock::new(None)),
            peers,
            links: Mutex::new(HashMap::new()),
            request_timeout,
        }
    }

    /// Start listening for peer connections
    pub async fn start(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("P2P listening on {}", addr);

        let inbound = self.inbound.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!("Peer connected from {}", peer_addr);
                        let inbound = inbound.clone();
                        let handler = handler.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, inbound, handler).await {
                                tracing::warn!("Peer connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    fn link(&self, peer: &PeerId) -> mpsc::Sender<Vec<u8>> {
        let mut links = self.links.lock();
        if let Some(link) = links.get(peer) {
            if !link.is_closed() {
                return link.clone();
            }
        }
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_peer_link(format!("ws://{}", peer), rx));
        links.insert(peer.clone(), tx.clone());
        tx
    }
}

async fn handle_connection(
    stream: TcpStream,
    inbound: broadcast::Sender<Envelope>,
    handler: Handler,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Binary(data)) => match Frame::from_bytes(&data) {
                Ok(Frame::Gossip(envelope)) => {
                    let _ = inbound.send(envelope);
                }
                Ok(Frame::Request(envelope)) => {
                    let current = handler.read().clone();
                    let reply = match current {
                        Some(h) => h.handle_request(envelope).await,
                        None => None,
                    };
                    ws_sender
                        .send(WsMessage::Binary(Frame::Reply(reply).to_bytes()))
                        .await?;
                }
                Ok(Frame::Reply(_)) => {
                    tracing::debug!("Ignoring unsolicited reply frame");
                }
                Err(e) => {
                    tracing::warn!("Dropping malformed frame: {}", e);
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

/// Forward queued gossip frames to one peer, reconnecting after failures.
/// Frames queued while the peer is unreachable are dropped.
async fn run_peer_link(url: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(first) = rx.recv().await {
        let (ws_stream, _) = match connect_async(&url).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::debug!("Peer {} unreachable: {}", url, e);
                continue;
            }
        };
        tracing::info!("Connected to peer {}", url);
        let (mut ws_sender, _) = ws_stream.split();

        if ws_sender.send(WsMessage::Binary(first)).await.is_err() {
            continue;
        }
        while let Some(data) = rx.recv().await {
            if let Err(e) = ws_sender.send(WsMessage::Binary(data)).await {
                tracing::warn!("Lost connection to peer {}: {}", url, e);
                break;
            }
        }
    }
}

/// One request frame out, one reply frame back, on a fresh connection
async fn request_reply(peer: &PeerId, envelope: Envelope) -> Result<Envelope, BusError> {
    let url = format!("ws://{}", peer);
    let (mut ws_stream, _) = connect_async(&url)
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?;
    ws_stream
        .send(WsMessage::Binary(Frame::Request(envelope).to_bytes()))
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?;

    while let Some(msg) = ws_stream.next().await {
        match msg.map_err(|e| BusError::Transport(e.to_string()))? {
            WsMessage::Binary(data) => {
                let frame =
                    Frame::from_bytes(&data).map_err(|e| BusError::Transport(e.to_string()))?;
                let _ = ws_stream.close(None).await;
                return match frame {
                    Frame::Reply(Some(reply)) => Ok(reply),
                    _ => Err(BusError::NoReply(peer.clone())),
                };
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(BusError::NoReply(peer.clone()))
}

#[async_trait]
impl MessageBus for WsBus {
    async fn broadcast(&self, envelope: Envelope) -> Result<(), BusError> {
        let _ = self.inbound.send(envelope.clone());
        let data = Frame::Gossip(envelope).to_bytes();
        for peer in &self.peers {
            let link = self.link(peer);
            if link.try_send(data.clone()).is_err() {
                tracing::warn!("Outbound queue to {} is full, dropping message", peer);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    async fn send_direct(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, BusError> {
        tokio::time::timeout(self.request_timeout, request_reply(peer, envelope))
            .await
            .map_err(|_| BusError::Timeout(peer.clone()))?
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    fn serve(&self, handler: Arc<dyn RequestHandler>) {
        *self.handler.write() = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use pos_chain::Keypair;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle_request(&self, request: Envelope) -> Option<Envelope> {
            Some(request)
        }
    }

    async fn free_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_gossip_and_direct_request() {
        let a_addr = free_addr().await;
        let b_addr = free_addr().await;
        let a = WsBus::new(vec![b_addr.clone()], Duration::from_secs(2));
        let b = WsBus::new(vec![a_addr.clone()], Duration::from_secs(2));
        a.start(&a_addr).await.unwrap();
        b.start(&b_addr).await.unwrap();
        b.serve(Arc::new(Echo));

        let keypair = Keypair::from_seed([1u8; 32]);
        let envelope = Message::RequestBlock { height: 3 }.seal(&keypair);

        let reply = a.send_direct(&b_addr, envelope.clone()).await.unwrap();
        assert_eq!(reply, envelope);

        let mut own = a.subscribe();
        let mut remote = b.subscribe();
        a.broadcast(envelope.clone()).await.unwrap();
        assert_eq!(own.recv().await.unwrap(), envelope);
        let received = tokio::time::timeout(Duration::from_secs(5), remote.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, envelope);
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_cleanly() {
        let bus = WsBus::new(vec![], Duration::from_millis(500));
        let keypair = Keypair::from_seed([1u8; 32]);
        let envelope = Message::RequestBlock { height: 3 }.seal(&keypair);
        let dead = free_addr().await;
        assert!(bus.send_direct(&dead, envelope).await.is_err());
    }
}
