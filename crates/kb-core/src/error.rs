//! Error types for the knowledge-base service and their caller-visible mapping.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using KbError.
pub type Result<T> = std::result::Result<T, KbError>;

/// Longest message carried by an `Internal` error.
const MAX_INTERNAL_MESSAGE: usize = 200;

/// Errors that can occur in the knowledge-base service.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KbError {
    /// Backing engine failed to initialize or is unreachable.
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Collection already exists.
    #[error("Collection already exists: {name}")]
    AlreadyExists { name: String },

    /// Collection not found.
    #[error("Collection not found: {name}")]
    NotFound { name: String },

    /// Invalid argument provided.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Tool payload does not match the tool's input schema.
    #[error("Schema validation failed for '{field}': {reason}")]
    SchemaValidation { field: String, reason: String },

    /// No tool registered under this name.
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    /// Operation did not complete in time.
    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl KbError {
    /// Create a store-unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: summarize(&message.into()),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a schema validation error.
    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error for a collection.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error. Only the first line of the message is kept.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: summarize(&message.into()),
        }
    }

    /// Stable name of the error kind, as exposed to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "StoreUnavailable",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::NotFound { .. } => "NotFound",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::SchemaValidation { .. } => "SchemaValidationError",
            Self::UnknownTool { .. } => "UnknownTool",
            Self::Timeout { .. } => "Timeout",
            Self::Config { .. } | Self::Internal { .. } => "Internal",
        }
    }

    /// Numeric code for JSON-RPC error responses.
    pub fn code(&self) -> i64 {
        match self {
            Self::UnknownTool { .. } => -32601,
            Self::SchemaValidation { .. } => -32602,
            Self::InvalidArgument { .. } => -32001,
            Self::NotFound { .. } => -32002,
            Self::AlreadyExists { .. } => -32003,
            Self::Timeout { .. } => -32004,
            Self::StoreUnavailable { .. } => -32005,
            Self::Config { .. } | Self::Internal { .. } => -32603,
        }
    }

    /// Convert into the uniform caller-visible error shape.
    pub fn to_body(&self) -> ErrorBody {
        let field = match self {
            Self::SchemaValidation { field, .. } => Some(field.clone()),
            _ => None,
        };

        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            data: Some(ErrorData {
                kind: self.kind().to_string(),
                field,
            }),
        }
    }
}

impl From<std::io::Error> for KbError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {}", err))
    }
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("Serialization error: {}", err))
    }
}

/// Caller-visible error: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

impl ErrorBody {
    /// Create an error body for a transport-level failure with no `KbError` behind it.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<&KbError> for ErrorBody {
    fn from(err: &KbError) -> Self {
        err.to_body()
    }
}

/// Extra error detail: the error kind and, for schema errors, the offending field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

fn summarize(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX_INTERNAL_MESSAGE {
        return line.to_string();
    }
    let mut short: String = line.chars().take(MAX_INTERNAL_MESSAGE).collect();
    short.push_str("...");
    short
}
