//! MCP server: JSON-RPC dispatch and the HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use kb_core::{KbConfig, KbError, Result};
use kb_store::KnowledgeBase;

use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR,
};
use crate::tools::ToolRegistry;

pub const SERVER_NAME: &str = "kb-mcp";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Knowledge-base MCP server.
///
/// Cheap to clone; every clone shares the same registry and store.
#[derive(Clone)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    request_timeout: Duration,
}

impl McpServer {
    pub fn new(kb: Arc<KnowledgeBase>, request_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(ToolRegistry::new(kb)),
            request_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Decode one raw JSON-RPC message and dispatch it.
    ///
    /// Returns `None` for notifications.
    pub async fn handle_message(&self, body: &[u8]) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                warn!("Rejected undecodable request: {}", e);
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {}", e),
                ));
            }
        };

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                format!("invalid request: {}", e),
            )),
        }
    }

    /// Dispatch a decoded request.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                request.id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "invalid jsonrpc version",
            ));
        }

        let notification = request.is_notification();
        let id = request.id.unwrap_or(Value::Null);
        debug!("Received '{}'", request.method);

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(id, self.initialize_result(&request.params)),
            "notifications/initialized" => return None,
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                JsonRpcResponse::success(id, json!({ "tools": self.registry.definitions() }))
            }
            "tools/call" => self.handle_tools_call(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("method not found: {}", other),
            ),
        };

        (!notification).then_some(response)
    }

    fn initialize_result(&self, params: &Value) -> Value {
        let version = params["protocolVersion"]
            .as_str()
            .unwrap_or(PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": {
                "name": SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        })
    }

    async fn handle_tools_call(&self, id: Value, params: Value) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("invalid params: {}", e))
            }
        };

        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.registry.call(&params.name, params.arguments),
        )
        .await
        .unwrap_or_else(|_| {
            Err(KbError::timeout(
                format!("tools/call {}", params.name),
                self.request_timeout.as_millis() as u64,
            ))
        });

        match outcome {
            Ok(output) => {
                info!("Tool '{}' succeeded", params.name);
                JsonRpcResponse::success(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": output.to_string() }],
                        "structuredContent": output,
                        "isError": false
                    }),
                )
            }
            Err(err) => {
                warn!("Tool '{}' failed: {}", params.name, err);
                JsonRpcResponse::from_error(id, &err)
            }
        }
    }

    /// HTTP routes: `POST /mcp` and `GET /health`.
    pub fn router(&self, max_concurrency: usize) -> Router {
        Router::new()
            .route("/mcp", post(mcp_handler))
            .route("/health", get(health_handler))
            .layer(ConcurrencyLimitLayer::new(max_concurrency.max(1)))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }
}

async fn mcp_handler(State(server): State<McpServer>, body: Bytes) -> Response {
    match server.handle_message(&body).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health_handler(State(server): State<McpServer>) -> Response {
    let kb = server.registry.knowledge_base();
    match kb.health().await {
        Ok(()) => Json(json!({ "status": "ok", "backend": kb.backend_name() })).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": err.to_body() })),
        )
            .into_response(),
    }
}

/// Build the store, serve until SIGINT/SIGTERM, then close the store.
pub async fn serve(config: &KbConfig) -> Result<()> {
    let kb = Arc::new(KnowledgeBase::from_config(config).await?);
    let server = McpServer::new(
        Arc::clone(&kb),
        Duration::from_millis(config.server.request_timeout_ms),
    );

    let listener = match tokio::net::TcpListener::bind(&config.server.bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            kb.close().await?;
            return Err(KbError::config(format!(
                "Failed to bind {}: {}",
                config.server.bind_address, e
            )));
        }
    };
    info!("Listening on http://{}/mcp", listener.local_addr()?);

    let served = axum::serve(listener, server.router(config.server.max_concurrency))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Closing knowledge base");
    kb.close().await?;
    served.map_err(KbError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
