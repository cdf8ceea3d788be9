//! SQLite-based vector backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension};
use tracing::{debug, info, warn};

use kb_core::{
    Collection, DocumentRecord, Filter, KbError, Match, Metadata, Result, StoreConfig,
    VectorBackend,
};

use crate::schema::SCHEMA;

/// SQLite-based backend with brute-force cosine search.
///
/// The connection sits behind a blocking Mutex and every operation runs on
/// the blocking thread pool via `spawn_blocking`. Once started, a blocking
/// task runs to completion even if the awaiting future is dropped, so each
/// write either commits fully or rolls back.
pub struct SqliteBackend {
    /// Connection; `None` once the backend is closed.
    conn: Arc<Mutex<Option<Connection>>>,

    /// Database location, `:memory:` for in-memory stores.
    path: PathBuf,
}

impl SqliteBackend {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KbError::store_unavailable(format!(
                    "Failed to create data directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| KbError::store_unavailable(format!("Failed to open database: {}", e)))?;

        Self::init(conn, path, config)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            KbError::store_unavailable(format!("Failed to open in-memory database: {}", e))
        })?;

        Self::init(conn, Path::new(":memory:"), &StoreConfig::default())
    }

    /// Initialize the store with a connection.
    fn init(conn: Connection, path: &Path, config: &StoreConfig) -> Result<Self> {
        Self::configure_connection(&conn, config)?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| KbError::store_unavailable(format!("Failed to initialize schema: {}", e)))?;

        info!("Database opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: path.to_path_buf(),
        })
    }

    /// Configure SQLite connection.
    fn configure_connection(conn: &Connection, config: &StoreConfig) -> Result<()> {
        let journal_mode = if config.wal_mode { "WAL" } else { "DELETE" };
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = {};
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = {};
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
            journal_mode, config.busy_timeout_ms
        ))
        .map_err(|e| KbError::store_unavailable(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    /// Database location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run an operation against the connection on the blocking pool.
    async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let conn = guard
                .as_mut()
                .ok_or_else(|| KbError::store_unavailable("store is closed"))?;
            f(conn)
        })
        .await
        .map_err(|e| KbError::internal(format!("database task failed: {}", e)))?
    }

    fn collection_exists(conn: &Connection, name: &str) -> Result<bool> {
        conn.prepare_cached("SELECT 1 FROM collections WHERE name = ?1")
            .and_then(|mut stmt| stmt.exists(params![name]))
            .map_err(db_err)
    }

    fn row_to_collection(
        name: String,
        metadata: Option<String>,
        created_at: i64,
    ) -> Result<Collection> {
        let metadata = metadata
            .map(|m| serde_json::from_str::<Metadata>(&m))
            .transpose()?;
        Ok(Collection {
            name,
            metadata,
            created_at: created_at as u64,
        })
    }

    /// Convert f32 vector to bytes (little-endian).
    fn vec_to_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Convert little-endian bytes back to an f32 vector.
    fn bytes_to_vec(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[async_trait]
impl VectorBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn heartbeat(&self) -> Result<()> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| KbError::store_unavailable(format!("Heartbeat failed: {}", e)))
        })
        .await
    }

    // Collection operations

    async fn create_collection(&self, collection: Collection) -> Result<()> {
        let metadata = collection
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO collections (name, metadata, created_at) VALUES (?1, ?2, ?3)",
                params![collection.name, metadata, collection.created_at as i64],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    KbError::AlreadyExists {
                        name: collection.name.clone(),
                    }
                } else {
                    db_err(e)
                }
            })?;

            debug!("Created collection: {}", collection.name);
            Ok(())
        })
        .await
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT name, metadata, created_at FROM collections ORDER BY name")
                .map_err(db_err)?;

            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<(String, Option<String>, i64)>, _>>()
                .map_err(db_err)?;

            rows.into_iter()
                .map(|(name, metadata, created_at)| {
                    Self::row_to_collection(name, metadata, created_at)
                })
                .collect()
        })
        .await
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run(move |conn| {
            let deleted = conn
                .execute("DELETE FROM collections WHERE name = ?1", params![name])
                .map_err(db_err)?;

            if deleted == 0 {
                return Err(KbError::NotFound { name });
            }

            debug!("Deleted collection: {}", name);
            Ok(())
        })
        .await
    }

    // Document operations

    async fn insert(&self, collection: &str, records: Vec<DocumentRecord>) -> Result<usize> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.id.as_str()) {
                return Err(KbError::invalid_argument(format!(
                    "duplicate id '{}' in request",
                    record.id
                )));
            }
        }

        let rows = records
            .into_iter()
            .map(|r| {
                let metadata = serde_json::to_string(&r.metadata)?;
                Ok((r.id, r.text, metadata, Self::vec_to_bytes(&r.embedding)))
            })
            .collect::<Result<Vec<_>>>()?;
        let collection = collection.to_string();

        self.run(move |conn| {
            let tx = conn.transaction().map_err(db_err)?;

            if !Self::collection_exists(&tx, &collection)? {
                return Err(KbError::not_found(collection));
            }

            {
                let mut existing = tx
                    .prepare("SELECT 1 FROM documents WHERE collection = ?1 AND id = ?2")
                    .map_err(db_err)?;
                for (id, ..) in &rows {
                    if existing.exists(params![collection, id]).map_err(db_err)? {
                        return Err(KbError::invalid_argument(format!(
                            "id '{}' already exists in collection '{}'",
                            id, collection
                        )));
                    }
                }

                let mut stmt = tx
                    .prepare(
                        "INSERT INTO documents (collection, id, content, metadata, embedding) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .map_err(db_err)?;
                for (id, text, metadata, embedding) in &rows {
                    stmt.execute(params![collection, id, text, metadata, embedding])
                        .map_err(db_err)?;
                }
            }

            tx.commit().map_err(db_err)?;

            debug!("Inserted {} documents into {}", rows.len(), collection);
            Ok(rows.len())
        })
        .await
    }

    async fn query(
        &self,
        collection: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<Vec<Match>>> {
        let collection = collection.to_string();
        let candidates = self
            .run(move |conn| {
                if !Self::collection_exists(conn, &collection)? {
                    return Err(KbError::not_found(collection));
                }

                let mut stmt = conn
                    .prepare(
                        "SELECT id, content, metadata, embedding FROM documents \
                         WHERE collection = ?1 ORDER BY seq",
                    )
                    .map_err(db_err)?;

                let rows = stmt
                    .query_map(params![collection], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    })
                    .map_err(db_err)?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(db_err)?;

                let mut candidates = Vec::with_capacity(rows.len());
                for (id, text, metadata, embedding) in rows {
                    let metadata: Metadata = serde_json::from_str(&metadata)?;
                    if filter.as_ref().map_or(true, |f| f.matches(&metadata)) {
                        candidates.push((id, text, metadata, Self::bytes_to_vec(&embedding)));
                    }
                }
                Ok(candidates)
            })
            .await?;

        let mut results = Vec::with_capacity(embeddings.len());
        for query in &embeddings {
            let mut scored = Vec::with_capacity(candidates.len());
            for (index, (.., embedding)) in candidates.iter().enumerate() {
                if embedding.len() != query.len() {
                    return Err(KbError::internal(format!(
                        "stored embedding has dimension {} but query has {}",
                        embedding.len(),
                        query.len()
                    )));
                }
                scored.push((index, cosine_distance(query, embedding)));
            }

            // Stable sort keeps insertion order among equal distances.
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(n_results);

            results.push(
                scored
                    .into_iter()
                    .map(|(index, distance)| {
                        let (id, text, metadata, _) = &candidates[index];
                        Match {
                            id: id.clone(),
                            text: text.clone(),
                            metadata: metadata.clone(),
                            distance,
                        }
                    })
                    .collect(),
            );
        }

        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let collection = collection.to_string();
        self.run(move |conn| {
            if !Self::collection_exists(conn, &collection)? {
                return Err(KbError::not_found(collection));
            }
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                    params![collection],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count as usize)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| KbError::internal(format!("Failed to close database: {}", e)))?;
            info!("Database closed at {:?}", self.path);
        }
        Ok(())
    }
}

/// Cosine distance `1 - cos(a, b)`, in `[0, 2]`.
///
/// A zero vector is treated as orthogonal to everything.
fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

fn db_err(e: rusqlite::Error) -> KbError {
    warn!("Database error: {}", e);
    KbError::internal(format!("Database error: {}", e))
}
