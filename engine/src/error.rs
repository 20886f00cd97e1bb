//! Error types for the shelf engine.

use crate::DocumentId;
use thiserror::Error;

/// All errors the store surfaces to callers.
///
/// Corrupt shard files, failed flushes and failed legacy migrations are not
/// represented here: they are logged and recovered where they happen.
#[derive(Debug, Error)]
pub enum Error {
    // Document errors
    #[error("duplicate key: {0}")]
    DuplicateKey(DocumentId),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("field '_id' is immutable (document {0})")]
    ImmutableId(DocumentId),

    // Query errors
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Store errors
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    #[error("collection is closed: {0}")]
    Closed(String),

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    // Storage errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
