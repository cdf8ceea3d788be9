//! The vector store adapter used by the tool layer.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use kb_core::{
    validate_document_metadata, Collection, DocumentRecord, Embedder, Filter, KbConfig, KbError,
    Metadata, QueryResult, Result, StoreMode, VectorBackend,
};
use kb_embed::HashingEmbedder;

use crate::remote::RemoteBackend;
use crate::sqlite::SqliteBackend;

/// Process-wide handle to the document store.
///
/// Create it once at startup, share it behind an `Arc`, and call
/// [`close`](Self::close) on shutdown. Writes (create, add, delete) hold an
/// exclusive per-collection lock; queries share it, so a caller always sees
/// its own completed writes.
pub struct KnowledgeBase {
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    locks: Mutex<HashMap<String, LockEntry>>,
    timeout: Duration,
}

/// A collection lock plus the number of callers currently holding it.
#[derive(Default)]
struct LockEntry {
    lock: Arc<RwLock<()>>,
    users: usize,
}

/// Per-collection lock for the duration of one operation.
///
/// The map entry is removed when the last handle for a name drops, so the
/// map only holds collections with an operation in flight.
struct CollectionLock<'a> {
    locks: &'a Mutex<HashMap<String, LockEntry>>,
    name: String,
    lock: Arc<RwLock<()>>,
}

impl CollectionLock<'_> {
    async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read().await
    }

    async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write().await
    }
}

impl Drop for CollectionLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = locks.get_mut(&self.name) {
            entry.users -= 1;
            if entry.users == 0 {
                locks.remove(&self.name);
            }
        }
    }
}

impl KnowledgeBase {
    /// Wrap a backend and an embedder.
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            embedder,
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Build the store described by `config`, failing fast if it is unreachable.
    pub async fn from_config(config: &KbConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.store.timeout_ms);
        let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimension)?);

        let backend: Arc<dyn VectorBackend> = match config.store.mode {
            StoreMode::InMemory => Arc::new(SqliteBackend::open_memory()?),
            StoreMode::OnDisk => Arc::new(SqliteBackend::open(
                config.store.database_path(),
                &config.store,
            )?),
            StoreMode::Remote => Arc::new(RemoteBackend::new(config.store.remote_url(), timeout)?),
        };
        backend.heartbeat().await?;

        info!(
            "Knowledge base ready (mode: {}, backend: {})",
            config.store.mode,
            backend.name()
        );
        Ok(Self::new(backend, embedder, timeout))
    }

    /// In-memory store with default settings.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(
            Arc::new(SqliteBackend::open_memory()?),
            Arc::new(HashingEmbedder::default()),
            Duration::from_millis(KbConfig::default().store.timeout_ms),
        ))
    }

    /// Name of the active backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock_for(&self, name: &str) -> CollectionLock<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = locks.entry(name.to_string()).or_default();
        entry.users += 1;

        CollectionLock {
            locks: &self.locks,
            name: name.to_string(),
            lock: Arc::clone(&entry.lock),
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| KbError::timeout(operation, self.timeout.as_millis() as u64))?
    }

    /// Create a new, empty collection.
    pub async fn create_collection(&self, name: &str, metadata: Option<Metadata>) -> Result<()> {
        validate_name(name)?;
        let lock = self.lock_for(name);

        self.with_timeout("create_collection", async {
            let _guard = lock.write().await;
            self.backend
                .create_collection(Collection::new(name, metadata))
                .await
        })
        .await?;

        info!("Created collection '{}'", name);
        Ok(())
    }

    /// Embed and store documents; returns how many were stored.
    ///
    /// Ids are generated when `ids` is `None`. The whole batch is rejected
    /// if any id is already taken.
    pub async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<String>,
        ids: Option<Vec<String>>,
        metadatas: Option<Vec<Metadata>>,
    ) -> Result<usize> {
        validate_name(collection)?;
        if documents.is_empty() {
            return Err(KbError::invalid_argument("documents must not be empty"));
        }
        if let Some(ids) = &ids {
            check_parallel("ids", ids.len(), documents.len())?;
            validate_ids(ids)?;
        }
        if let Some(metadatas) = &metadatas {
            check_parallel("metadatas", metadatas.len(), documents.len())?;
            for metadata in metadatas {
                validate_document_metadata(metadata)?;
            }
        }

        let ids = ids.unwrap_or_else(|| {
            documents
                .iter()
                .map(|_| DocumentRecord::generate_id())
                .collect()
        });
        let mut metadatas = metadatas
            .unwrap_or_else(|| vec![Metadata::new(); documents.len()])
            .into_iter();
        let lock = self.lock_for(collection);

        let stored = self
            .with_timeout("add_documents", async {
                let texts: Vec<&str> = documents.iter().map(String::as_str).collect();
                let embeddings = self.embedder.embed_documents(&texts).await?;

                let records = documents
                    .iter()
                    .zip(ids)
                    .zip(embeddings)
                    .map(|((text, id), embedding)| DocumentRecord {
                        id,
                        text: text.clone(),
                        metadata: metadatas.next().unwrap_or_default(),
                        embedding,
                    })
                    .collect();

                let _guard = lock.write().await;
                self.backend.insert(collection, records).await
            })
            .await?;

        info!("Added {} documents to '{}'", stored, collection);
        Ok(stored)
    }

    /// Nearest-neighbor query, one result list per query text.
    pub async fn query_documents(
        &self,
        collection: &str,
        query_texts: Vec<String>,
        n_results: usize,
        filter: Option<&Value>,
    ) -> Result<QueryResult> {
        validate_name(collection)?;
        if query_texts.is_empty() {
            return Err(KbError::invalid_argument("query_texts must not be empty"));
        }
        if n_results == 0 {
            return Err(KbError::invalid_argument("n_results must be a positive integer"));
        }
        let filter = filter.map(Filter::parse).transpose()?;
        let lock = self.lock_for(collection);

        let matches = self
            .with_timeout("query_documents", async {
                let mut embeddings = Vec::with_capacity(query_texts.len());
                for text in &query_texts {
                    embeddings.push(self.embedder.embed_query(text).await?);
                }

                let _guard = lock.read().await;
                self.backend
                    .query(collection, embeddings, n_results, filter)
                    .await
            })
            .await?;

        debug!(
            "Queried '{}' with {} texts (n_results={})",
            collection,
            query_texts.len(),
            n_results
        );
        Ok(QueryResult::from_matches(matches))
    }

    /// Delete a collection and every document in it.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let lock = self.lock_for(name);

        self.with_timeout("delete_collection", async {
            let _guard = lock.write().await;
            self.backend.delete_collection(name).await
        })
        .await?;

        info!("Deleted collection '{}'", name);
        Ok(())
    }

    /// Number of documents in a collection.
    pub async fn count_documents(&self, collection: &str) -> Result<usize> {
        validate_name(collection)?;
        let lock = self.lock_for(collection);

        self.with_timeout("count_documents", async {
            let _guard = lock.read().await;
            self.backend.count(collection).await
        })
        .await
    }

    /// All collections, ordered by name.
    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.with_timeout("list_collections", self.backend.list_collections())
            .await
    }

    /// Check the backend is reachable.
    pub async fn health(&self) -> Result<()> {
        self.with_timeout("health", self.backend.heartbeat()).await
    }

    /// Release the backend. Later calls fail with `StoreUnavailable`.
    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(KbError::invalid_argument("collection_name must not be empty"));
    }
    Ok(())
}

fn check_parallel(field: &str, len: usize, expected: usize) -> Result<()> {
    if len != expected {
        return Err(KbError::invalid_argument(format!(
            "{} has {} entries but documents has {}",
            field, len, expected
        )));
    }
    Ok(())
}

fn validate_ids(ids: &[String]) -> Result<()> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if id.is_empty() {
            return Err(KbError::invalid_argument("ids must not contain empty strings"));
        }
        if !seen.insert(id.as_str()) {
            return Err(KbError::invalid_argument(format!(
                "duplicate id '{}' in request",
                id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kb_core::Match;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn notes() -> KnowledgeBase {
        let kb = KnowledgeBase::in_memory().unwrap();
        kb.create_collection("notes", None).await.unwrap();
        kb
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let kb = KnowledgeBase::in_memory().unwrap();
        kb.create_collection("notes", None).await.unwrap();

        let err = kb.create_collection("notes", None).await.unwrap_err();
        assert_eq!(err.kind(), "AlreadyExists");
    }

    #[tokio::test]
    async fn test_missing_collection_is_not_found() {
        let kb = KnowledgeBase::in_memory().unwrap();

        let add = kb
            .add_documents("ghost", strings(&["text"]), None, None)
            .await
            .unwrap_err();
        let query = kb
            .query_documents("ghost", strings(&["text"]), 5, None)
            .await
            .unwrap_err();
        let delete = kb.delete_collection("ghost").await.unwrap_err();

        assert_eq!(add.kind(), "NotFound");
        assert_eq!(query.kind(), "NotFound");
        assert_eq!(delete.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_sky_scenario() {
        let kb = notes().await;
        kb.add_documents(
            "notes",
            strings(&["the sky is blue", "grass is green"]),
            Some(strings(&["d1", "d2"])),
            None,
        )
        .await
        .unwrap();

        let result = kb
            .query_documents("notes", strings(&["sky color"]), 1, None)
            .await
            .unwrap();
        assert_eq!(result.ids, vec![vec!["d1".to_string()]]);

        kb.delete_collection("notes").await.unwrap();
        let err = kb
            .query_documents("notes", strings(&["sky color"]), 1, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn test_self_retrieval() {
        let kb = notes().await;
        let docs = strings(&[
            "rust ownership and borrowing",
            "tokio runtime schedules tasks",
            "sqlite stores rows in pages",
            "vectors are compared by cosine distance",
        ]);
        let ids = strings(&["a", "b", "c", "d"]);
        kb.add_documents("notes", docs.clone(), Some(ids.clone()), None)
            .await
            .unwrap();

        for (doc, id) in docs.iter().zip(&ids) {
            let result = kb
                .query_documents("notes", vec![doc.clone()], 1, None)
                .await
                .unwrap();
            assert_eq!(&result.ids[0][0], id);
            assert!(result.distances[0][0] < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_query_result_shape() {
        let kb = notes().await;
        kb.add_documents(
            "notes",
            strings(&["alpha beta", "beta gamma", "gamma delta"]),
            None,
            None,
        )
        .await
        .unwrap();

        let result = kb
            .query_documents("notes", strings(&["beta", "delta", "zeta"]), 2, None)
            .await
            .unwrap();

        assert_eq!(result.documents.len(), 3);
        assert_eq!(result.ids.len(), 3);
        assert_eq!(result.metadatas.len(), 3);
        assert_eq!(result.distances.len(), 3);
        for i in 0..3 {
            let n = result.ids[i].len();
            assert!(n <= 2);
            assert_eq!(result.documents[i].len(), n);
            assert_eq!(result.metadatas[i].len(), n);
            assert_eq!(result.distances[i].len(), n);
            assert!(result.distances[i].windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let kb = notes().await;

        let cases = vec![
            kb.add_documents("notes", vec![], None, None).await,
            kb.add_documents("notes", strings(&["a", "b"]), Some(strings(&["1"])), None)
                .await,
            kb.add_documents("notes", strings(&["a"]), None, Some(vec![])).await,
            kb.add_documents("notes", strings(&["a", "b"]), Some(strings(&["x", "x"])), None)
                .await,
            kb.add_documents(
                "notes",
                strings(&["a"]),
                None,
                Some(vec![json!({"tags": ["x"]}).as_object().cloned().unwrap()]),
            )
            .await,
        ];
        for result in cases {
            assert_eq!(result.unwrap_err().kind(), "InvalidArgument");
        }

        assert_eq!(kb.count_documents("notes").await.unwrap(), 0);

        let empty = kb.query_documents("notes", vec![], 5, None).await;
        assert_eq!(empty.unwrap_err().kind(), "InvalidArgument");

        let zero = kb.query_documents("notes", strings(&["a"]), 0, None).await;
        assert_eq!(zero.unwrap_err().kind(), "InvalidArgument");

        let bad_filter = kb
            .query_documents("notes", strings(&["a"]), 5, Some(&json!({"$nor": []})))
            .await;
        assert_eq!(bad_filter.unwrap_err().kind(), "InvalidArgument");

        let blank = kb.create_collection("  ", None).await;
        assert_eq!(blank.unwrap_err().kind(), "InvalidArgument");
    }

    #[tokio::test]
    async fn test_duplicate_id_across_calls_is_rejected() {
        let kb = notes().await;
        kb.add_documents("notes", strings(&["first"]), Some(strings(&["d1"])), None)
            .await
            .unwrap();

        let err = kb
            .add_documents(
                "notes",
                strings(&["second", "third"]),
                Some(strings(&["d2", "d1"])),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "InvalidArgument");
        assert_eq!(kb.count_documents("notes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_metadata_filter_and_generated_ids() {
        let kb = notes().await;
        kb.add_documents(
            "notes",
            strings(&["report on rivers", "report on lakes"]),
            None,
            Some(vec![
                json!({"source": "article"}).as_object().cloned().unwrap(),
                json!({"source": "blog"}).as_object().cloned().unwrap(),
            ]),
        )
        .await
        .unwrap();

        let result = kb
            .query_documents(
                "notes",
                strings(&["report"]),
                5,
                Some(&json!({"source": "blog"})),
            )
            .await
            .unwrap();

        assert_eq!(result.ids[0].len(), 1);
        assert_eq!(result.documents[0][0], "report on lakes");
        assert_eq!(result.metadatas[0][0]["source"], "blog");
        assert_eq!(result.ids[0][0].len(), 26);
    }

    #[tokio::test]
    async fn test_recreated_collection_is_empty() {
        let kb = notes().await;
        kb.add_documents("notes", strings(&["old generation"]), None, None)
            .await
            .unwrap();

        kb.delete_collection("notes").await.unwrap();
        kb.create_collection("notes", None).await.unwrap();

        let result = kb
            .query_documents("notes", strings(&["old generation"]), 5, None)
            .await
            .unwrap();
        assert!(result.ids[0].is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_adds_keep_ids_unique() {
        let kb = Arc::new(notes().await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let kb = Arc::clone(&kb);
            handles.push(tokio::spawn(async move {
                kb.add_documents(
                    "notes",
                    vec![format!("document {}", i)],
                    Some(vec!["shared".to_string()]),
                    None,
                )
                .await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(kb.count_documents("notes").await.unwrap(), 1);
        assert_eq!(kb.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_near_duplicate_texts_retrieve_themselves() {
        let kb = notes().await;
        let docs = strings(&[
            "Sky is blue",
            "sky is blue",
            "sky is BLUE!",
            "blue is sky",
            "sky, is blue",
            "???",
        ]);
        let ids = strings(&["a", "b", "c", "d", "e", "f"]);
        kb.add_documents("notes", docs.clone(), Some(ids.clone()), None)
            .await
            .unwrap();

        let result = kb
            .query_documents("notes", docs.clone(), 6, None)
            .await
            .unwrap();
        for (q, id) in ids.iter().enumerate() {
            assert_eq!(&result.ids[q][0], id, "query {:?}", docs[q]);
            assert!(result.distances[q][0] < 1e-5);
            assert!(result.distances[q][1] > 1e-3, "query {:?} ties", docs[q]);
        }
    }

    #[tokio::test]
    async fn test_locks_are_released_after_use() {
        let kb = KnowledgeBase::in_memory().unwrap();

        for i in 0..50 {
            let name = format!("missing-{}", i);
            let err = kb.count_documents(&name).await.unwrap_err();
            assert_eq!(err.kind(), "NotFound");
            kb.delete_collection(&name).await.unwrap_err();
        }
        assert_eq!(kb.lock_count(), 0);

        for i in 0..20 {
            let name = format!("temp-{}", i);
            kb.create_collection(&name, None).await.unwrap();
            kb.add_documents(&name, strings(&["x"]), None, None)
                .await
                .unwrap();
            kb.delete_collection(&name).await.unwrap();
        }
        assert_eq!(kb.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_add_is_all_or_nothing() {
        let backend: Arc<dyn VectorBackend> = Arc::new(SqliteBackend::open_memory().unwrap());
        let reader = KnowledgeBase::new(
            Arc::clone(&backend),
            Arc::new(HashingEmbedder::default()),
            Duration::from_secs(10),
        );
        reader.create_collection("bulk", None).await.unwrap();
        let docs: Vec<String> = (0..2000).map(|i| format!("bulk document {}", i)).collect();

        // Deadline expires while the insert is in flight
        let hasty = KnowledgeBase::new(
            Arc::clone(&backend),
            Arc::new(HashingEmbedder::default()),
            Duration::from_micros(1),
        );
        let _ = hasty.add_documents("bulk", docs.clone(), None, None).await;
        let count = reader.count_documents("bulk").await.unwrap();
        assert!(count == 0 || count == docs.len(), "partial insert of {}", count);
        assert_eq!(hasty.lock_count(), 0);

        // Caller goes away mid-request
        reader.delete_collection("bulk").await.unwrap();
        reader.create_collection("bulk", None).await.unwrap();
        let reader = Arc::new(reader);
        let task = {
            let reader = Arc::clone(&reader);
            let docs = docs.clone();
            tokio::spawn(async move { reader.add_documents("bulk", docs, None, None).await })
        };
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        let count = reader.count_documents("bulk").await.unwrap();
        assert!(count == 0 || count == docs.len(), "partial insert of {}", count);
        assert_eq!(reader.lock_count(), 0);
    }

    struct StalledBackend;

    #[async_trait]
    impl VectorBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn heartbeat(&self) -> Result<()> {
            Ok(())
        }
        async fn create_collection(&self, _collection: Collection) -> Result<()> {
            std::future::pending().await
        }
        async fn list_collections(&self) -> Result<Vec<Collection>> {
            Ok(Vec::new())
        }
        async fn delete_collection(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn insert(&self, _collection: &str, _records: Vec<DocumentRecord>) -> Result<usize> {
            Ok(0)
        }
        async fn query(
            &self,
            _collection: &str,
            _embeddings: Vec<Vec<f32>>,
            _n_results: usize,
            _filter: Option<Filter>,
        ) -> Result<Vec<Vec<Match>>> {
            std::future::pending().await
        }
        async fn count(&self, _collection: &str) -> Result<usize> {
            Ok(0)
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let kb = KnowledgeBase::new(
            Arc::new(StalledBackend),
            Arc::new(HashingEmbedder::default()),
            Duration::from_millis(50),
        );

        let err = kb.create_collection("slow", None).await.unwrap_err();
        assert_eq!(err.kind(), "Timeout");

        let err = kb
            .query_documents("slow", strings(&["q"]), 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KbError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_remote_fails_fast() {
        let mut config = KbConfig::default();
        config.store.mode = StoreMode::Remote;
        config.store.host = "127.0.0.1".to_string();
        config.store.port = 1;
        config.store.timeout_ms = 2000;

        match KnowledgeBase::from_config(&config).await {
            Ok(_) => panic!("expected unreachable remote store to fail"),
            Err(err) => assert_eq!(err.kind(), "StoreUnavailable"),
        }
    }

    #[tokio::test]
    async fn test_from_config_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KbConfig::default();
        config.store.data_dir = dir.path().join("nested");

        let kb = KnowledgeBase::from_config(&config).await.unwrap();
        assert_eq!(kb.backend_name(), "sqlite");
        kb.health().await.unwrap();
        assert!(config.store.database_path().exists());
        kb.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_makes_store_unavailable() {
        let kb = notes().await;
        kb.close().await.unwrap();

        let err = kb.list_collections().await.unwrap_err();
        assert_eq!(err.kind(), "StoreUnavailable");
    }
}
