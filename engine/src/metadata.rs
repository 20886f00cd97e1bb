//! Collection metadata file (`metadata.json`).
//!
//! A summary of shard sizes and counts, rewritten on every flush. The only
//! field read back at open time is `nextShardId`, which keeps shard ids from
//! being reused after a shard is removed.

use crate::{error::Result, shard::ShardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// File name of the metadata file inside a collection directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Per-shard summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMetadata {
    pub id: ShardId,
    pub document_count: usize,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Summary of a collection's on-disk layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionMetadata {
    pub total_documents: usize,
    pub total_shards: usize,
    /// Next id to hand out; older files may lack it
    #[serde(default)]
    pub next_shard_id: Option<ShardId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_optimized: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shards: Vec<ShardMetadata>,
}

impl CollectionMetadata {
    /// Metadata for a collection created now.
    pub fn new() -> Self {
        Self {
            total_documents: 0,
            total_shards: 0,
            next_shard_id: None,
            created_at: Utc::now(),
            last_optimized: None,
            shards: Vec::new(),
        }
    }

    /// Read the metadata file from a collection directory, if present.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write the metadata file into a collection directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::shard::write_atomic(&dir.join(METADATA_FILE), &bytes)?;
        Ok(())
    }
}

impl Default for CollectionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CollectionMetadata::load(dir.path()).unwrap().is_none());

        let mut meta = CollectionMetadata::new();
        meta.total_documents = 3;
        meta.total_shards = 1;
        meta.next_shard_id = Some(4);
        meta.shards.push(ShardMetadata {
            id: 3,
            document_count: 3,
            file_size: 120,
            last_modified: Utc::now(),
        });
        meta.save(dir.path()).unwrap();

        let loaded = CollectionMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn camel_case_on_disk() {
        let meta = CollectionMetadata::new();
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("totalDocuments").is_some());
        assert!(json.get("lastOptimized").is_some());
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn tolerates_minimal_files() {
        let json = r#"{
            "totalDocuments": 1,
            "totalShards": 1,
            "createdAt": "2024-01-01T00:00:00Z"
        }"#;
        let meta: CollectionMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.next_shard_id, None);
        assert!(meta.shards.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "not json").unwrap();
        assert!(CollectionMetadata::load(dir.path()).is_err());
    }
}
