//! kb-mcp - MCP server implementation
//!
//! This crate exposes a [`kb_store::KnowledgeBase`] as MCP tools over
//! JSON-RPC 2.0 on HTTP (`POST /mcp`, `GET /health`).
//!
//! # Tools
//!
//! - `create_collection` - Create a new, empty collection
//! - `add_documents` - Embed and store documents in a collection
//! - `query_documents` - Nearest-neighbor search over a collection
//! - `delete_collection` - Delete a collection and its documents

pub mod protocol;
mod server;
mod tools;

pub use protocol::{JsonRpcRequest, JsonRpcResponse};
pub use server::{serve, McpServer, PROTOCOL_VERSION, SERVER_NAME};
pub use tools::{
    AddDocumentsInput, CreateCollectionInput, DeleteCollectionInput, QueryDocumentsInput,
    StatusOutput, ToolDefinition, ToolRegistry,
};
