//! Unified error handling for the data layer.

use crate::config::ConfigError;

/// Data layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Engine error: {0}")]
    Engine(#[from] shelf_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Malformed record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for repository calls.
pub type Result<T> = std::result::Result<T, DataError>;
