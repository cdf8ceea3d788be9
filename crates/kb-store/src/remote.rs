//! Remote vector backend speaking the Chroma REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use kb_core::{Collection, DocumentRecord, Filter, KbError, Match, Metadata, Result, VectorBackend};

/// Backend that forwards operations to a Chroma-compatible server.
///
/// Embeddings are computed locally and sent alongside documents, so the
/// server never needs an embedding function of its own.
pub struct RemoteBackend {
    client: Client,
    base_url: String,
    timeout_ms: u64,
}

/// Collection record as returned by the server.
#[derive(Debug, Deserialize)]
struct RemoteCollection {
    id: String,
    name: String,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Debug, Serialize)]
struct AddRequest<'a> {
    ids: Vec<&'a str>,
    embeddings: Vec<&'a [f32]>,
    documents: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadatas: Option<Vec<Option<&'a Metadata>>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
}

impl QueryResponse {
    /// Zip the server's parallel lists back into per-query matches.
    fn into_matches(self) -> Vec<Vec<Match>> {
        let mut documents = self.documents.unwrap_or_default().into_iter();
        let mut metadatas = self.metadatas.unwrap_or_default().into_iter();
        let mut distances = self.distances.unwrap_or_default().into_iter();

        self.ids
            .into_iter()
            .map(|ids| {
                let mut docs = documents.next().unwrap_or_default().into_iter();
                let mut metas = metadatas.next().unwrap_or_default().into_iter();
                let mut dists = distances.next().unwrap_or_default().into_iter();

                ids.into_iter()
                    .map(|id| Match {
                        id,
                        text: docs.next().flatten().unwrap_or_default(),
                        metadata: metas.next().flatten().unwrap_or_default(),
                        distance: dists.next().unwrap_or(f32::MAX),
                    })
                    .collect()
            })
            .collect()
    }
}

impl RemoteBackend {
    /// Create a client for the server at `base_url` without contacting it.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KbError::store_unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| self.transport_err(e))
    }

    fn transport_err(&self, e: reqwest::Error) -> KbError {
        warn!("Remote store request failed: {}", e);
        if e.is_timeout() {
            KbError::timeout("remote store request", self.timeout_ms)
        } else if e.is_connect() {
            KbError::store_unavailable(format!("Cannot reach {}", self.base_url))
        } else {
            KbError::internal(format!("Remote store request failed: {}", e))
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(&self, response: Response, name: &str) -> Result<T> {
        let response = check(response, name).await?;
        response
            .json()
            .await
            .map_err(|e| KbError::internal(format!("Malformed response from remote store: {}", e)))
    }

    async fn remote_collection(&self, name: &str) -> Result<RemoteCollection> {
        let response = self
            .send(self.client.get(self.url(&format!("collections/{}", name))))
            .await?;
        self.json(response, name).await
    }
}

/// Pass successful responses through; map failures to caller-visible errors.
async fn check(response: Response, name: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(map_remote_error(status, &body, name))
}

fn map_remote_error(status: StatusCode, body: &str, name: &str) -> KbError {
    let lower = body.to_lowercase();
    if status == StatusCode::NOT_FOUND || lower.contains("does not exist") {
        KbError::not_found(name)
    } else if status == StatusCode::CONFLICT || lower.contains("already exists") {
        KbError::AlreadyExists {
            name: name.to_string(),
        }
    } else if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        KbError::invalid_argument(format!("remote store rejected request: {}", body))
    } else if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::BAD_GATEWAY {
        KbError::store_unavailable(format!("remote store returned {}", status))
    } else {
        KbError::internal(format!("remote store returned {}: {}", status, body))
    }
}

#[async_trait]
impl VectorBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn heartbeat(&self) -> Result<()> {
        let response = self.send(self.client.get(self.url("heartbeat"))).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(KbError::store_unavailable(format!(
                "heartbeat returned {}",
                response.status()
            )))
        }
    }

    async fn create_collection(&self, collection: Collection) -> Result<()> {
        let body = json!({
            "name": collection.name,
            "metadata": collection.metadata,
            "get_or_create": false,
        });
        let response = self
            .send(self.client.post(self.url("collections")).json(&body))
            .await?;
        check(response, &collection.name).await?;

        debug!("Created remote collection: {}", collection.name);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<Collection>> {
        let response = self.send(self.client.get(self.url("collections"))).await?;
        let remote: Vec<RemoteCollection> = self.json(response, "").await?;

        let mut collections: Vec<Collection> = remote
            .into_iter()
            .map(|r| Collection {
                name: r.name,
                metadata: r.metadata,
                created_at: 0,
            })
            .collect();
        collections.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(collections)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .send(self.client.delete(self.url(&format!("collections/{}", name))))
            .await?;
        check(response, name).await?;

        debug!("Deleted remote collection: {}", name);
        Ok(())
    }

    async fn insert(&self, collection: &str, records: Vec<DocumentRecord>) -> Result<usize> {
        let remote = self.remote_collection(collection).await?;

        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            return Err(KbError::invalid_argument(format!(
                "duplicate id '{}' in request",
                pair[0]
            )));
        }

        // The server silently skips existing ids on add, so check first.
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("collections/{}/get", remote.id)))
                    .json(&json!({"ids": ids, "include": []})),
            )
            .await?;
        let existing: GetResponse = self.json(response, collection).await?;
        if let Some(id) = existing.ids.first() {
            return Err(KbError::invalid_argument(format!(
                "id '{}' already exists in collection '{}'",
                id, collection
            )));
        }

        let any_metadata = records.iter().any(|r| !r.metadata.is_empty());
        let request = AddRequest {
            ids: records.iter().map(|r| r.id.as_str()).collect(),
            embeddings: records.iter().map(|r| r.embedding.as_slice()).collect(),
            documents: records.iter().map(|r| r.text.as_str()).collect(),
            metadatas: any_metadata.then(|| {
                records
                    .iter()
                    .map(|r| (!r.metadata.is_empty()).then_some(&r.metadata))
                    .collect()
            }),
        };

        let response = self
            .send(
                self.client
                    .post(self.url(&format!("collections/{}/add", remote.id)))
                    .json(&request),
            )
            .await?;
        check(response, collection).await?;

        debug!("Inserted {} documents into remote {}", records.len(), collection);
        Ok(records.len())
    }

    async fn query(
        &self,
        collection: &str,
        embeddings: Vec<Vec<f32>>,
        n_results: usize,
        filter: Option<Filter>,
    ) -> Result<Vec<Vec<Match>>> {
        let remote = self.remote_collection(collection).await?;

        let mut body = json!({
            "query_embeddings": embeddings,
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            body["where"] = filter.to_value();
        }

        let response = self
            .send(
                self.client
                    .post(self.url(&format!("collections/{}/query", remote.id)))
                    .json(&body),
            )
            .await?;
        let parsed: QueryResponse = self.json(response, collection).await?;
        Ok(parsed.into_matches())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let remote = self.remote_collection(collection).await?;
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("collections/{}/count", remote.id))),
            )
            .await?;
        let count: Value = self.json(response, collection).await?;
        count
            .as_u64()
            .map(|c| c as usize)
            .ok_or_else(|| KbError::internal("remote store returned a non-numeric count"))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing remote vector store client for {}", self.base_url);
        Ok(())
    }
}
