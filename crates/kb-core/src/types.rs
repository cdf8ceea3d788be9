//! Core domain types for the knowledge base.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{KbError, Result};

/// Free-form key/value metadata attached to collections and documents.
pub type Metadata = serde_json::Map<String, Value>;

/// Default number of matches returned per query text.
pub const DEFAULT_N_RESULTS: usize = 5;

/// A named namespace of documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    /// Collection name (unique identifier).
    pub name: String,

    /// Optional metadata, fixed at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Creation timestamp (Unix millis).
    pub created_at: u64,
}

impl Collection {
    /// Create a new collection.
    pub fn new(name: &str, metadata: Option<Metadata>) -> Self {
        Self {
            name: name.to_string(),
            metadata,
            created_at: now_millis(),
        }
    }
}

/// A document ready to be written to a backend: text, metadata and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    /// Identifier, unique within the collection.
    pub id: String,

    /// Content the embedding was derived from.
    pub text: String,

    /// Scalar metadata usable for filtering.
    pub metadata: Metadata,

    /// Embedding vector.
    pub embedding: Vec<f32>,
}

impl DocumentRecord {
    /// Generate a fresh identifier for documents added without one.
    pub fn generate_id() -> String {
        Ulid::new().to_string()
    }
}

/// A single nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    /// Dissimilarity to the query; lower is closer.
    pub distance: f32,
}

/// Result of a similarity query.
///
/// The four sequences are parallel: one inner list per query text, and
/// within each inner list index `i` describes the same matched document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub documents: Vec<Vec<String>>,
    pub ids: Vec<Vec<String>>,
    pub metadatas: Vec<Vec<Metadata>>,
    pub distances: Vec<Vec<f32>>,
}

impl QueryResult {
    /// Build a result from per-query match lists, preserving backend order.
    pub fn from_matches(per_query: Vec<Vec<Match>>) -> Self {
        let mut result = Self::default();
        for matches in per_query {
            result.push_query(matches);
        }
        result
    }

    /// Append the matches for one query text.
    pub fn push_query(&mut self, matches: Vec<Match>) {
        let mut documents = Vec::with_capacity(matches.len());
        let mut ids = Vec::with_capacity(matches.len());
        let mut metadatas = Vec::with_capacity(matches.len());
        let mut distances = Vec::with_capacity(matches.len());

        for m in matches {
            documents.push(m.text);
            ids.push(m.id);
            metadatas.push(m.metadata);
            distances.push(m.distance);
        }

        self.documents.push(documents);
        self.ids.push(ids);
        self.metadatas.push(metadatas);
        self.distances.push(distances);
    }

    /// Number of query texts this result answers.
    pub fn num_queries(&self) -> usize {
        self.ids.len()
    }
}

/// Check that every value in document metadata is a scalar.
pub fn validate_document_metadata(metadata: &Metadata) -> Result<()> {
    for (key, value) in metadata {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            other => {
                return Err(KbError::invalid_argument(format!(
                    "metadata value for '{}' must be a string, number or boolean, got {}",
                    key,
                    json_type_name(other)
                )));
            }
        }
    }
    Ok(())
}

/// Human-readable JSON type name, used in validation messages.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
