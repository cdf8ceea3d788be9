//! kb-embed - Local text embedding
//!
//! This crate provides a deterministic, dependency-light embedding function
//! used by the knowledge base to turn document and query text into vectors.
//!
//! # Features
//!
//! - Feature hashing of lowercase word tokens with blake3
//! - Signed buckets to keep unrelated collisions from accumulating
//! - L2 normalization
//! - Identical texts always produce identical vectors

mod hashing;

pub use hashing::HashingEmbedder;

// Re-export the Embedder trait for convenience
pub use kb_core::Embedder;
