//! Consensus - stake-weighted propose/vote/commit with chain sync
//!
//! Architecture:
//! - The proposer for each height is picked from the validator set by stake,
//!   seeded with the parent block hash
//! - The proposer broadcasts a block; validators check it and vote
//! - Once a quorum of stake has voted the proposer broadcasts the commit and
//!   every node applies it
//! - Stalled rounds time out and move to the next proposer
//! - Lagging nodes catch up block by block over direct requests

pub mod broadcast;
pub mod bus;
pub mod engine;
pub mod error;
pub mod leader;
pub mod message;
pub mod node;
pub mod sync;
pub mod types;
pub mod validator;

pub use broadcast::WsBus;
pub use bus::{LocalBus, LocalNetwork, MessageBus, PeerId, RequestHandler};
pub use engine::{ConsensusEngine, Inbound};
pub use error::{BusError, CommitError, EnvelopeError, ProposerError, SyncError, ValidationError};
pub use leader::{round_seed, round_state, select_proposer};
pub use message::{BlockVote, Envelope, Message, MessageKind};
pub use node::{Node, NodeHandle, Submission};
pub use sync::{BlockServer, SyncOutcome, Syncer};
pub use types::*;
