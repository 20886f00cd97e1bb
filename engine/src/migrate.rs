//! One-time migration of flat `<name>.json` collections into the sharded layout.

use crate::{
    document::{ensure_id, into_stored_document},
    error::Result,
    metadata::{CollectionMetadata, ShardMetadata},
    shard::{decode_documents, encode_documents, list_shard_files, shard_file_name, write_atomic},
    Document,
};
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Path of the pre-sharding file for a collection.
pub fn legacy_path(root: &Path, name: &str) -> PathBuf {
    root.join(format!("{name}.json"))
}

/// Move a legacy flat file into `dir` as `shard_0.json` plus metadata, then delete it.
///
/// Returns the number of documents migrated, or `None` when there was nothing
/// to do. A directory that already holds shards is left alone, and so is the
/// legacy file next to it. Scalar ids are kept in string form. If any entry
/// cannot be migrated the legacy file is kept so nothing is lost.
pub fn migrate_legacy_file(legacy: &Path, dir: &Path, compact: bool) -> Result<Option<usize>> {
    if !legacy.is_file() {
        return Ok(None);
    }
    fs::create_dir_all(dir)?;
    if !list_shard_files(dir)?.is_empty() {
        warn!(
            legacy = %legacy.display(),
            dir = %dir.display(),
            "Collection already sharded, leaving legacy file in place"
        );
        return Ok(None);
    }

    let values = decode_documents(&fs::read(legacy)?)?;
    let mut seen = HashSet::new();
    let mut skipped = 0;
    let mut docs: Vec<Document> = Vec::with_capacity(values.len());
    for value in values {
        let mut doc = match into_stored_document(value) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(legacy = %legacy.display(), error = %e, "Skipping malformed legacy document");
                skipped += 1;
                continue;
            }
        };
        let id = ensure_id(&mut doc);
        if !seen.insert(id.clone()) {
            warn!(legacy = %legacy.display(), id = %id, "Skipping duplicate legacy document");
            skipped += 1;
            continue;
        }
        docs.push(doc);
    }

    let bytes = encode_documents(&docs, compact)?;
    write_atomic(&dir.join(shard_file_name(0)), &bytes)?;

    let now = Utc::now();
    let metadata = CollectionMetadata {
        total_documents: docs.len(),
        total_shards: 1,
        next_shard_id: Some(1),
        created_at: now,
        last_optimized: None,
        shards: vec![ShardMetadata {
            id: 0,
            document_count: docs.len(),
            file_size: bytes.len() as u64,
            last_modified: now,
        }],
    };
    metadata.save(dir)?;

    if skipped > 0 {
        warn!(
            legacy = %legacy.display(),
            skipped,
            "Some legacy documents could not be migrated, keeping legacy file"
        );
    } else {
        fs::remove_file(legacy)?;
    }

    Ok(Some(docs.len()))
}
