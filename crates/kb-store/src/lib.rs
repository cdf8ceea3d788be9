//! kb-store - Vector store adapter and backends
//!
//! [`KnowledgeBase`] is the adapter the tool layer talks to. It validates
//! arguments, embeds text, serializes writes per collection and enforces
//! timeouts, then delegates to a [`VectorBackend`](kb_core::VectorBackend):
//!
//! - [`SqliteBackend`] - SQLite file or in-memory database
//! - [`RemoteBackend`] - Chroma-compatible REST server

mod knowledge_base;
mod remote;
mod schema;
mod sqlite;

pub use knowledge_base::KnowledgeBase;
pub use remote::RemoteBackend;
pub use sqlite::SqliteBackend;
