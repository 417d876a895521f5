//! Signed protocol envelope and the typed messages it carries

use crate::error::EnvelopeError;
use borsh::{BorshDeserialize, BorshSerialize};
use pos_chain::crypto::{self, Keypair};
use pos_chain::{Address, Block, Commit, Hash, Signature, Transaction, Vote};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum MessageKind {
    NewTransaction,
    BlockProposal,
    Vote,
    Commit,
    RequestBlock,
    ResponseBlock,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Envelope fields covered by the sender's signature
#[derive(BorshSerialize)]
struct EnvelopeBody<'a> {
    kind: MessageKind,
    timestamp: i64,
    payload: &'a [u8],
    sender: Address,
}

/// Wire format exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Unix millis
    pub timestamp: i64,
    pub payload: Vec<u8>,
    pub sender: Address,
    pub signature: Signature,
}

impl Envelope {
    pub fn seal(kind: MessageKind, payload: Vec<u8>, keypair: &Keypair) -> Self {
        let mut envelope = Self {
            kind,
            timestamp: pos_chain::now_millis(),
            payload,
            sender: keypair.address(),
            signature: Signature::EMPTY,
        };
        envelope.signature = keypair.sign(&envelope.signing_bytes());
        envelope
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = EnvelopeBody {
            kind: self.kind,
            timestamp: self.timestamp,
            payload: &self.payload,
            sender: self.sender,
        };
        borsh::to_vec(&body).expect("Envelope body serialization should not fail")
    }

    pub fn verify(&self) -> Result<(), EnvelopeError> {
        crypto::verify(&self.sender, &self.signing_bytes(), &self.signature)
            .map_err(|_| EnvelopeError::InvalidSignature(self.sender))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Envelope serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// A vote together with the slot it belongs to, so stale votes can be
/// dropped without re-encoding the block
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockVote {
    pub height: u64,
    pub round: u32,
    pub block_hash: Hash,
    pub vote: Vote,
}

/// Decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    NewTransaction(Transaction),
    BlockProposal(Block),
    Vote(BlockVote),
    Commit(Commit),
    RequestBlock { height: u64 },
    ResponseBlock(Block),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::NewTransaction(_) => MessageKind::NewTransaction,
            Message::BlockProposal(_) => MessageKind::BlockProposal,
            Message::Vote(_) => MessageKind::Vote,
            Message::Commit(_) => MessageKind::Commit,
            Message::RequestBlock { .. } => MessageKind::RequestBlock,
            Message::ResponseBlock(_) => MessageKind::ResponseBlock,
        }
    }

    fn payload(&self) -> Vec<u8> {
        let encoded = match self {
            Message::NewTransaction(tx) => borsh::to_vec(tx),
            Message::BlockProposal(block) | Message::ResponseBlock(block) => borsh::to_vec(block),
            Message::Vote(vote) => borsh::to_vec(vote),
            Message::Commit(commit) => borsh::to_vec(commit),
            Message::RequestBlock { height } => borsh::to_vec(height),
        };
        encoded.expect("Message payload serialization should not fail")
    }

    /// Encode and sign into an envelope from `keypair`
    pub fn seal(&self, keypair: &Keypair) -> Envelope {
        Envelope::seal(self.kind(), self.payload(), keypair)
    }

    /// Verify the envelope and decode its payload
    pub fn open(envelope: &Envelope) -> Result<Message, EnvelopeError> {
        envelope.verify()?;
        let data = envelope.payload.as_slice();
        let message = match envelope.kind {
            MessageKind::NewTransaction => Message::NewTransaction(borsh::from_slice(data)?),
            MessageKind::BlockProposal => Message::BlockProposal(borsh::from_slice(data)?),
            MessageKind::Vote => Message::Vote(borsh::from_slice(data)?),
            MessageKind::Commit => Message::Commit(borsh::from_slice(data)?),
            MessageKind::RequestBlock => Message::RequestBlock {
                height: borsh::from_slice(data)?,
            },
            MessageKind::ResponseBlock => Message::ResponseBlock(borsh::from_slice(data)?),
        };
        Ok(message)
    }
}
