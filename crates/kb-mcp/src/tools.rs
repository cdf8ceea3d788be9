//! Tool registry: the four collection tools, their schemas and dispatch.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use kb_core::{json_type_name, KbError, Metadata, Result, DEFAULT_N_RESULTS};
use kb_store::KnowledgeBase;

/// Input of `create_collection`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCollectionInput {
    pub collection_name: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// Input of `add_documents`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddDocumentsInput {
    pub collection_name: String,
    pub documents: Vec<String>,
    #[serde(default)]
    pub ids: Option<Vec<String>>,
    #[serde(default)]
    pub metadatas: Option<Vec<Metadata>>,
}

/// Input of `query_documents`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDocumentsInput {
    pub collection_name: String,
    pub query_texts: Vec<String>,
    #[serde(default)]
    pub n_results: Option<i64>,
    #[serde(default, rename = "where")]
    pub filter: Option<Value>,
}

/// Input of `delete_collection`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteCollectionInput {
    pub collection_name: String,
}

/// Output of the tools that do not return data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusOutput {
    pub success: bool,
    pub message: String,
}

impl StatusOutput {
    fn ok(message: String) -> Self {
        Self {
            success: true,
            message,
        }
    }
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub output_schema: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    CreateCollection,
    AddDocuments,
    QueryDocuments,
    DeleteCollection,
}

impl Tool {
    const ALL: [Tool; 4] = [
        Tool::CreateCollection,
        Tool::AddDocuments,
        Tool::QueryDocuments,
        Tool::DeleteCollection,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::CreateCollection => "create_collection",
            Self::AddDocuments => "add_documents",
            Self::QueryDocuments => "query_documents",
            Self::DeleteCollection => "delete_collection",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.name() == name)
    }

    fn definition(self) -> ToolDefinition {
        let (description, input_schema, output_schema) = match self {
            Self::CreateCollection => (
                "Create a new, empty collection of documents.",
                json!({
                    "type": "object",
                    "properties": {
                        "collection_name": {"type": "string", "description": "Unique collection name"},
                        "metadata": {"type": "object", "description": "Optional collection metadata"}
                    },
                    "required": ["collection_name"],
                    "additionalProperties": false
                }),
                status_schema(),
            ),
            Self::AddDocuments => (
                "Add documents to a collection. Ids are generated when omitted.",
                json!({
                    "type": "object",
                    "properties": {
                        "collection_name": {"type": "string"},
                        "documents": {"type": "array", "items": {"type": "string"}},
                        "ids": {"type": "array", "items": {"type": "string"}},
                        "metadatas": {"type": "array", "items": {"type": "object"}}
                    },
                    "required": ["collection_name", "documents"],
                    "additionalProperties": false
                }),
                status_schema(),
            ),
            Self::QueryDocuments => (
                "Find the documents most similar to each query text.",
                json!({
                    "type": "object",
                    "properties": {
                        "collection_name": {"type": "string"},
                        "query_texts": {"type": "array", "items": {"type": "string"}},
                        "n_results": {"type": "integer", "default": DEFAULT_N_RESULTS},
                        "where": {"type": "object", "description": "Metadata filter"}
                    },
                    "required": ["collection_name", "query_texts"],
                    "additionalProperties": false
                }),
                json!({
                    "type": "object",
                    "properties": {
                        "documents": {"type": "array", "items": {"type": "array", "items": {"type": "string"}}},
                        "ids": {"type": "array", "items": {"type": "array", "items": {"type": "string"}}},
                        "metadatas": {"type": "array", "items": {"type": "array", "items": {"type": "object"}}},
                        "distances": {"type": "array", "items": {"type": "array", "items": {"type": "number"}}}
                    },
                    "required": ["documents", "ids", "metadatas", "distances"]
                }),
            ),
            Self::DeleteCollection => (
                "Delete a collection and every document in it.",
                json!({
                    "type": "object",
                    "properties": {
                        "collection_name": {"type": "string"}
                    },
                    "required": ["collection_name"],
                    "additionalProperties": false
                }),
                status_schema(),
            ),
        };

        ToolDefinition {
            name: self.name(),
            description,
            input_schema,
            output_schema,
        }
    }
}

fn status_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "success": {"type": "boolean"},
            "message": {"type": "string"}
        },
        "required": ["success", "message"]
    })
}

/// Dispatches tool calls to the knowledge base.
pub struct ToolRegistry {
    kb: Arc<KnowledgeBase>,
    definitions: Vec<ToolDefinition>,
}

impl ToolRegistry {
    /// Register the four collection tools against `kb`.
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        let definitions = Tool::ALL.into_iter().map(Tool::definition).collect();
        Self { kb, definitions }
    }

    /// Tool definitions in registration order.
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// Validate `arguments` and run the named tool.
    ///
    /// Returns the tool's output as JSON. Validation failures are
    /// `SchemaValidation`; everything else comes from the knowledge base.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value> {
        let tool = Tool::from_name(name).ok_or_else(|| KbError::UnknownTool {
            name: name.to_string(),
        })?;
        let definition = &self.definitions[tool as usize];

        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        validate_arguments(&definition.input_schema, &arguments)?;
        debug!("Calling tool '{}'", name);

        match tool {
            Tool::CreateCollection => {
                let input: CreateCollectionInput = decode(arguments)?;
                self.kb
                    .create_collection(&input.collection_name, input.metadata)
                    .await?;
                to_output(StatusOutput::ok(format!(
                    "Successfully created collection {}",
                    input.collection_name
                )))
            }
            Tool::AddDocuments => {
                let input: AddDocumentsInput = decode(arguments)?;
                let count = self
                    .kb
                    .add_documents(
                        &input.collection_name,
                        input.documents,
                        input.ids,
                        input.metadatas,
                    )
                    .await?;
                to_output(StatusOutput::ok(format!(
                    "Successfully added {} documents to collection {}",
                    count, input.collection_name
                )))
            }
            Tool::QueryDocuments => {
                let input: QueryDocumentsInput = decode(arguments)?;
                let n_results = match input.n_results {
                    Some(n) => usize::try_from(n).unwrap_or(0),
                    None => DEFAULT_N_RESULTS,
                };
                let result = self
                    .kb
                    .query_documents(
                        &input.collection_name,
                        input.query_texts,
                        n_results,
                        input.filter.as_ref(),
                    )
                    .await?;
                to_output(result)
            }
            Tool::DeleteCollection => {
                let input: DeleteCollectionInput = decode(arguments)?;
                self.kb.delete_collection(&input.collection_name).await?;
                to_output(StatusOutput::ok(format!(
                    "Successfully deleted collection {}",
                    input.collection_name
                )))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| KbError::schema("arguments", e.to_string()))
}

fn to_output<T: Serialize>(output: T) -> Result<Value> {
    Ok(serde_json::to_value(output)?)
}

/// Check `arguments` against an input schema built by [`Tool::definition`].
///
/// Covers the subset those schemas use: required and unknown properties,
/// and `string` / `integer` / `object` / `array` types with typed items.
/// Optional properties may be `null`.
fn validate_arguments(schema: &Value, arguments: &Value) -> Result<()> {
    let args = arguments
        .as_object()
        .ok_or_else(|| KbError::schema("arguments", "expected an object"))?;
    let properties = schema["properties"].as_object().cloned().unwrap_or_default();
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    for key in args.keys() {
        if !properties.contains_key(key) {
            return Err(KbError::schema(key.as_str(), "unknown field"));
        }
    }
    for field in &required {
        if !args.contains_key(*field) {
            return Err(KbError::schema(*field, "missing required field"));
        }
    }
    for (key, value) in args {
        if value.is_null() && !required.contains(&key.as_str()) {
            continue;
        }
        check_type(key, &properties[key], value)?;
    }
    Ok(())
}

fn check_type(field: &str, schema: &Value, value: &Value) -> Result<()> {
    let expected = schema["type"].as_str().unwrap_or_default();
    let ok = match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    };
    if !ok {
        return Err(KbError::schema(
            field,
            format!("expected {}, got {}", expected, json_type_name(value)),
        ));
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (i, item) in items.iter().enumerate() {
            check_type(&format!("{}[{}]", field, i), item_schema, item)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(KnowledgeBase::in_memory().unwrap()))
    }

    fn schema_field(err: KbError) -> String {
        match err {
            KbError::SchemaValidation { field, .. } => field,
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_exactly_four_tools() {
        let registry = registry();
        let names: Vec<_> = registry.definitions().iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec![
                "create_collection",
                "add_documents",
                "query_documents",
                "delete_collection"
            ]
        );

        let listed = serde_json::to_value(registry.definitions()).unwrap();
        assert!(listed[0]["inputSchema"]["properties"]["collection_name"].is_object());
        assert!(listed[2]["outputSchema"]["properties"]["distances"].is_object());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let err = registry().call("drop_everything", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "UnknownTool");
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn test_schema_errors_name_the_field() {
        let registry = registry();

        let missing = registry.call("create_collection", json!({})).await.unwrap_err();
        assert_eq!(schema_field(missing), "collection_name");

        let unknown = registry
            .call("delete_collection", json!({"collection_name": "x", "force": true}))
            .await
            .unwrap_err();
        assert_eq!(schema_field(unknown), "force");

        let wrong_type = registry
            .call("add_documents", json!({"collection_name": "x", "documents": "text"}))
            .await
            .unwrap_err();
        assert_eq!(schema_field(wrong_type), "documents");

        let wrong_item = registry
            .call("add_documents", json!({"collection_name": "x", "documents": ["a", 2]}))
            .await
            .unwrap_err();
        assert_eq!(schema_field(wrong_item), "documents[1]");

        let fractional = registry
            .call(
                "query_documents",
                json!({"collection_name": "x", "query_texts": ["a"], "n_results": 1.5}),
            )
            .await
            .unwrap_err();
        assert_eq!(schema_field(fractional), "n_results");

        let not_object = registry.call("create_collection", json!(["x"])).await.unwrap_err();
        assert_eq!(schema_field(not_object), "arguments");
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let registry = registry();

        let created = registry
            .call("create_collection", json!({"collection_name": "notes"}))
            .await
            .unwrap();
        assert_eq!(created["success"], true);

        let added = registry
            .call(
                "add_documents",
                json!({
                    "collection_name": "notes",
                    "documents": ["the sky is blue", "grass is green"],
                    "ids": ["d1", "d2"],
                    "metadatas": [{"topic": "sky"}, {"topic": "ground"}]
                }),
            )
            .await
            .unwrap();
        assert!(added["message"].as_str().unwrap().contains("2 documents"));

        let result = registry
            .call(
                "query_documents",
                json!({"collection_name": "notes", "query_texts": ["sky color"], "n_results": 1}),
            )
            .await
            .unwrap();
        assert_eq!(result["ids"], json!([["d1"]]));
        assert_eq!(result["metadatas"], json!([[{"topic": "sky"}]]));

        let deleted = registry
            .call("delete_collection", json!({"collection_name": "notes"}))
            .await
            .unwrap();
        assert_eq!(deleted["success"], true);
    }

    #[tokio::test]
    async fn test_defaults_and_nulls() {
        let registry = registry();
        registry
            .call("create_collection", json!({"collection_name": "c", "metadata": null}))
            .await
            .unwrap();

        let docs: Vec<String> = (0..8).map(|i| format!("document number {}", i)).collect();
        registry
            .call("add_documents", json!({"collection_name": "c", "documents": docs}))
            .await
            .unwrap();

        let result = registry
            .call("query_documents", json!({"collection_name": "c", "query_texts": ["document"]}))
            .await
            .unwrap();
        assert_eq!(result["ids"][0].as_array().unwrap().len(), DEFAULT_N_RESULTS);
        assert_eq!(result["metadatas"][0][0], json!({}));

        let explicit_null = registry
            .call(
                "query_documents",
                json!({"collection_name": "c", "query_texts": ["document"], "n_results": null, "where": null}),
            )
            .await
            .unwrap();
        assert_eq!(explicit_null["ids"][0].as_array().unwrap().len(), DEFAULT_N_RESULTS);
    }

    #[tokio::test]
    async fn test_non_positive_n_results_is_invalid_argument() {
        let registry = registry();
        registry
            .call("create_collection", json!({"collection_name": "c"}))
            .await
            .unwrap();

        for n in [0, -3] {
            let err = registry
                .call(
                    "query_documents",
                    json!({"collection_name": "c", "query_texts": ["q"], "n_results": n}),
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument");
        }
    }
}
