//! RPC Server - JSON-RPC over HTTP for the node
//!
//! - Submission: sendTransaction (base64 borsh), answered with the node's
//!   accept or reject verdict
//! - Reads: getStatus, getBlock, getLatestBlock, getWallet, getValidators,
//!   getMempoolSize, getHealth, served straight from the ledger

pub mod http_server;
pub mod methods;

pub use http_server::HttpRpcServer;
pub use methods::{RpcContext, RpcError};

/// RPC Server configuration
#[derive(Clone, Debug)]
pub struct RpcServerConfig {
    /// HTTP RPC bind address
    pub http_addr: String,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8899".to_string(),
        }
    }
}
