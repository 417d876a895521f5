//! RPC Methods - JSON-RPC method handlers

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pos_chain::{Address, Block, LedgerStore, Mempool, Transaction, Validator, Wallet};
use pos_consensus::{NodeHandle, Phase};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// RPC context shared across handlers
pub struct RpcContext {
    pub store: Arc<dyn LedgerStore>,
    pub mempool: Arc<Mempool>,
    pub node: NodeHandle,
}

impl RpcContext {
    pub fn new(store: Arc<dyn LedgerStore>, mempool: Arc<Mempool>, node: NodeHandle) -> Self {
        Self {
            store,
            mempool,
            node,
        }
    }
}

// ============ Response Types ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub height: u64,
    pub tip_hash: String,
    pub mempool_size: usize,
    pub validators: usize,
    pub total_stake: u64,
    pub phase: Phase,
    pub round: Option<u32>,
    pub next_proposer: Option<Address>,
    pub blocks_committed: u64,
    pub blocks_synced: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTransactionResponse {
    pub signature: String,
}

// ============ RPC Handlers ============

/// Decode a base64 borsh transaction and hand it to the node.
///
/// Waits for the node's verdict; a rejection carries the reason.
pub async fn handle_send_transaction(
    ctx: &RpcContext,
    encoded: &str,
) -> Result<SendTransactionResponse, RpcError> {
    let tx_bytes = BASE64
        .decode(encoded)
        .map_err(|_| RpcError::InvalidParams("Invalid base64 encoding".to_string()))?;

    let tx = Transaction::from_bytes(&tx_bytes)
        .map_err(|_| RpcError::InvalidParams("Invalid transaction format".to_string()))?;

    let signature = ctx.node.submit(tx).await.map_err(RpcError::Rejected)?;
    Ok(SendTransactionResponse {
        signature: signature.to_string(),
    })
}

pub fn handle_get_status(ctx: &RpcContext) -> Result<StatusResponse, RpcError> {
    let tip = ctx.store.tip()?;
    let validators = ctx.store.validators()?;
    let stats = ctx.node.stats();

    Ok(StatusResponse {
        height: tip.height,
        tip_hash: tip.hash.to_string(),
        mempool_size: ctx.mempool.len(),
        validators: validators.len(),
        total_stake: ctx.store.total_stake()?,
        phase: stats.phase,
        round: stats.round.map(|r| r.round),
        next_proposer: stats.round.map(|r| r.proposer),
        blocks_committed: stats.blocks_committed,
        blocks_synced: stats.blocks_synced,
    })
}

pub fn handle_get_block(ctx: &RpcContext, height: u64) -> Result<Block, RpcError> {
    ctx.store
        .get_block(height)?
        .ok_or_else(|| RpcError::NotFound(format!("block {}", height)))
}

pub fn handle_get_latest_block(ctx: &RpcContext) -> Result<Block, RpcError> {
    Ok(ctx.store.tip()?)
}

/// Untouched addresses report an empty wallet
pub fn handle_get_wallet(ctx: &RpcContext, address: &str) -> Result<Wallet, RpcError> {
    let address: Address = address
        .parse()
        .map_err(|e| RpcError::InvalidParams(format!("Invalid address: {}", e)))?;
    Ok(ctx.store.wallet(&address)?)
}

pub fn handle_get_validators(ctx: &RpcContext) -> Result<Vec<Validator>, RpcError> {
    Ok(ctx.store.validators()?)
}

pub fn handle_get_mempool_size(ctx: &RpcContext) -> Result<usize, RpcError> {
    Ok(ctx.mempool.len())
}

pub fn handle_get_health() -> Result<String, RpcError> {
    Ok("ok".to_string())
}

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Transaction rejected: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<pos_chain::StoreError> for RpcError {
    fn from(e: pos_chain::StoreError) -> Self {
        RpcError::InternalError(e.to_string())
    }
}
