//! kb-core - Core types and traits for the knowledge-base tool service
//!
//! This crate provides the collection/document data model, the metadata
//! filter grammar, the error taxonomy with its caller-visible mapping, and
//! the traits implemented by vector backends and embedders.

pub mod config;
pub mod error;
pub mod filter;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::{ErrorBody, ErrorData, KbError, Result};
pub use filter::{Comparison, Filter};
pub use traits::*;
pub use types::*;
