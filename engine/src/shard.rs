//! Shard files: one JSON array of documents per file.
//!
//! A collection directory holds `shard_0.json`, `shard_1.json`, ... Each shard
//! tracks which documents it owns, how large it was when last written, and a
//! hash of the bytes this process last wrote. The hash lets the watcher tell
//! our own writes apart from external edits.

use crate::{document::strip_empty, error::Result, Document, DocumentId, Error, Options};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use xxhash_rust::xxh3::xxh3_64;

/// Numeric shard identifier, assigned monotonically per collection.
pub type ShardId = u64;

const SHARD_PREFIX: &str = "shard_";
const SHARD_SUFFIX: &str = ".json";

/// File name for a shard id.
pub fn shard_file_name(id: ShardId) -> String {
    format!("{SHARD_PREFIX}{id}{SHARD_SUFFIX}")
}

/// Parse a shard id out of a file name like `shard_12.json`.
pub fn parse_shard_file_name(name: &str) -> Option<ShardId> {
    name.strip_prefix(SHARD_PREFIX)?
        .strip_suffix(SHARD_SUFFIX)?
        .parse()
        .ok()
}

/// Shard files in a directory, ascending by id.
pub fn list_shard_files(dir: &Path) -> io::Result<Vec<(ShardId, PathBuf)>> {
    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(parse_shard_file_name) {
            shards.push((id, entry.path()));
        }
    }
    shards.sort_by_key(|(id, _)| *id);
    Ok(shards)
}

/// Serialize documents as a JSON array.
pub fn encode_documents<'a>(
    docs: impl IntoIterator<Item = &'a Document>,
    compact: bool,
) -> Result<Vec<u8>> {
    if compact {
        let stripped: Vec<Document> = docs.into_iter().map(strip_empty).collect();
        Ok(serde_json::to_vec(&stripped)?)
    } else {
        let docs: Vec<&Document> = docs.into_iter().collect();
        Ok(serde_json::to_vec_pretty(&docs)?)
    }
}

/// Parse a shard file's contents. An empty file is an empty shard.
pub fn decode_documents(bytes: &[u8]) -> Result<Vec<Value>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => Ok(items),
        other => Err(Error::InvalidDocument(format!(
            "shard must hold an array, got {}",
            crate::document::type_name(&other)
        ))),
    }
}

/// Replace a file's contents via a sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Content hash used as the write generation marker.
pub fn content_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// What the filesystem reports for a file, used to skip unchanged files cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub len: u64,
}

impl FileStamp {
    /// Stat a file. `None` when it does not exist.
    pub fn read(path: &Path) -> io::Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(Self {
                modified: meta.modified()?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-memory bookkeeping for one shard file.
#[derive(Debug, Clone)]
pub struct Shard {
    pub id: ShardId,
    pub path: PathBuf,
    members: HashSet<DocumentId>,
    /// Bytes on disk after the last write, plus estimates for inserts since
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
    dirty: bool,
    written_hash: Option<u64>,
    seen: Option<FileStamp>,
}

impl Shard {
    /// Create bookkeeping for a shard in `dir`. Nothing is written.
    pub fn new(id: ShardId, dir: &Path) -> Self {
        Self {
            id,
            path: dir.join(shard_file_name(id)),
            members: HashSet::new(),
            file_size: 0,
            last_modified: Utc::now(),
            dirty: false,
            written_hash: None,
            seen: None,
        }
    }

    /// Number of documents owned by this shard.
    pub fn document_count(&self) -> usize {
        self.members.len()
    }

    /// Ids owned by this shard.
    pub fn members(&self) -> &HashSet<DocumentId> {
        &self.members
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Whether an insert may be routed here.
    pub fn has_capacity(&self, options: &Options) -> bool {
        self.members.len() < options.max_documents_per_file && self.file_size < options.max_file_size
    }

    /// Take ownership of a document. `estimated_size` grows the size estimate.
    pub fn add(&mut self, id: DocumentId, estimated_size: u64) {
        self.members.insert(id);
        self.file_size += estimated_size;
        self.dirty = true;
    }

    /// Give up ownership of a document.
    pub fn remove(&mut self, id: &str) -> bool {
        let removed = self.members.remove(id);
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Drop every member, returning them. Used by reload and rebalance.
    pub fn take_members(&mut self) -> HashSet<DocumentId> {
        self.dirty = true;
        std::mem::take(&mut self.members)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Write `bytes` to this shard's file and record them as our latest generation.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        write_atomic(&self.path, bytes)?;
        self.record_generation(bytes);
        self.seen = FileStamp::read(&self.path)?;
        self.dirty = false;
        Ok(())
    }

    /// Record bytes read from (or written to) disk as the current generation.
    pub fn record_generation(&mut self, bytes: &[u8]) {
        self.written_hash = Some(content_hash(bytes));
        self.file_size = bytes.len() as u64;
        self.last_modified = Utc::now();
    }

    /// Remember the stamp of the file as last observed.
    pub fn observe(&mut self, stamp: Option<FileStamp>) {
        self.seen = stamp;
    }

    /// Whether the stamp differs from what we last saw.
    pub fn stamp_changed(&self, stamp: &FileStamp) -> bool {
        self.seen.as_ref() != Some(stamp)
    }

    /// Whether file contents differ from the last generation we wrote or loaded.
    pub fn is_foreign(&self, bytes: &[u8]) -> bool {
        self.written_hash != Some(content_hash(bytes))
    }

    /// Restore ownership after a reload without marking the shard dirty.
    pub(crate) fn adopt(&mut self, members: HashSet<DocumentId>) {
        self.members = members;
        self.dirty = false;
    }
}
