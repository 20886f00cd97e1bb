//! Configuration management for the data layer.

use shelf_engine::Options;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Data layer configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one sub-directory per collection
    pub db_root: PathBuf,
    /// Options applied to every collection
    pub options: Options,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_root = lookup("SHELF_DB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./db"));

        let mut options = Options::default();

        if let Some(value) = lookup("SHELF_WATCH_FILES") {
            options.watch_files = parse_bool(&value).ok_or(ConfigError::Invalid {
                key: "SHELF_WATCH_FILES",
                value,
            })?;
        }
        if let Some(value) = lookup("SHELF_WATCH_INTERVAL_MS") {
            let millis: u64 = parse("SHELF_WATCH_INTERVAL_MS", value)?;
            options = options.with_watch_interval(Duration::from_millis(millis));
        }
        if let Some(value) = lookup("SHELF_COMPRESSION") {
            let level: u8 = parse("SHELF_COMPRESSION", value)?;
            options = options.with_compression_level(level);
        }
        if let Some(value) = lookup("SHELF_MAX_FILE_SIZE") {
            let bytes: u64 = parse("SHELF_MAX_FILE_SIZE", value)?;
            options = options.with_max_file_size(bytes);
        }
        if let Some(value) = lookup("SHELF_MAX_DOCUMENTS") {
            let count: usize = parse("SHELF_MAX_DOCUMENTS", value)?;
            options = options.with_max_documents_per_file(count);
        }

        Ok(Self { db_root, options })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_root: PathBuf::from("./db"),
            options: Options::default(),
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {key} value: {value:?}")]
    Invalid { key: &'static str, value: String },
}
