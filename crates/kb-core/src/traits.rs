//! Core traits defining the interfaces between components.

use async_trait::async_trait;

use crate::error::Result;
use crate::filter::Filter;
use crate::types::{Collection, DocumentRecord, Match};

/// A similarity-search engine holding collections of embedded documents.
///
/// Implementations must make `insert` and `delete_collection` atomic: on
/// error (or when the caller goes away mid-call) the store is left as it was.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Cheap liveness check against the engine.
    async fn heartbeat(&self) -> Result<()>;

    // Collection operations
    async fn create_collection(&self, collection: Collection) -> Result<()>;
    async fn list_collections(&self) -> Result<Vec<Collection>>;
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Insert records into an existing collection.
    ///
    /// Rejects the whole batch with `InvalidArgument` if any id is already
    /// present in the collection or repeated within the batch.
    async fn insert(&self, collection: &str, records: Vec<DocumentRecord>) -> Result<usize>;

    /// Nearest-neighbor search, one result list per embedding.
    ///
    /// Each list holds at most `n_results` matches ordered by ascending distance.
    async fn query(
        &self,
        collection: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<Vec<Match>>>;

    /// Number of documents in a collection.
    async fn count(&self, collection: &str) -> Result<usize>;

    /// Release the engine handle.
    async fn close(&self) -> Result<()>;
}

/// Embedding model trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of document texts.
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the embedding dimension.
    fn dimension(&self) -> usize;
}
