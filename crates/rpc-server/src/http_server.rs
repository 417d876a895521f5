//! HTTP JSON-RPC Server
//!
//! Provides HTTP endpoint for JSON-RPC methods.

use crate::methods::{
    handle_get_block, handle_get_health, handle_get_latest_block, handle_get_mempool_size,
    handle_get_status, handle_get_validators, handle_get_wallet, handle_send_transaction,
    RpcContext, RpcError,
};
use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// JSON-RPC request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

/// HTTP RPC Server
pub struct HttpRpcServer {
    context: Arc<RpcContext>,
}

impl HttpRpcServer {
    pub fn new(context: Arc<RpcContext>) -> Self {
        Self { context }
    }

    /// Create the Axum router
    pub fn router(self) -> Router {
        // CORS layer to allow browser clients
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

        Router::new()
            .route("/", post(handle_rpc))
            .layer(cors)
            .with_state(self.context)
    }

    /// Serve until the listener fails
    pub async fn run(self, addr: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("HTTP RPC server listening on {}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn handle_rpc(
    State(context): State<Arc<RpcContext>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    (StatusCode::OK, Json(process(&context, request).await))
}

/// Run one request through the method table and wrap the outcome
pub async fn process(ctx: &RpcContext, request: JsonRpcRequest) -> JsonRpcResponse {
    match dispatch_method(ctx, &request.method, request.params).await {
        Ok(value) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: Some(value),
            error: None,
        },
        Err(e) => JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id,
            result: None,
            error: Some(JsonRpcError {
                code: error_code(&e),
                message: e.to_string(),
            }),
        },
    }
}

fn positional(params: Value) -> Vec<Value> {
    serde_json::from_value(params).unwrap_or_default()
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::InternalError(e.to_string()))
}

async fn dispatch_method(ctx: &RpcContext, method: &str, params: Value) -> Result<Value, RpcError> {
    tracing::debug!("RPC method called: {}", method);
    match method {
        "sendTransaction" => {
            let params = positional(params);
            let transaction = params
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::InvalidParams("Missing transaction".to_string()))?;
            to_value(handle_send_transaction(ctx, transaction).await?)
        }

        "getStatus" => to_value(handle_get_status(ctx)?),

        "getBlock" => {
            let params = positional(params);
            let height = params
                .first()
                .and_then(|v| v.as_u64())
                .ok_or_else(|| RpcError::InvalidParams("Missing block height".to_string()))?;
            to_value(handle_get_block(ctx, height)?)
        }

        "getLatestBlock" => to_value(handle_get_latest_block(ctx)?),

        "getWallet" => {
            let params = positional(params);
            let address = params
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| RpcError::InvalidParams("Missing address".to_string()))?;
            to_value(handle_get_wallet(ctx, address)?)
        }

        "getValidators" => to_value(handle_get_validators(ctx)?),

        "getMempoolSize" => Ok(json!(handle_get_mempool_size(ctx)?)),

        "getHealth" => Ok(json!(handle_get_health()?)),

        "getVersion" => Ok(json!({
            "pos-node": env!("CARGO_PKG_VERSION"),
        })),

        _ => Err(RpcError::MethodNotFound(method.to_string())),
    }
}

/// Map error to JSON-RPC error code
fn error_code(error: &RpcError) -> i32 {
    match error {
        RpcError::InvalidParams(_) => -32602,
        RpcError::MethodNotFound(_) => -32601,
        RpcError::InternalError(_) => -32603,
        RpcError::Rejected(_) => -32002,
        RpcError::NotFound(_) => -32004,
    }
}
