//! Collection - a named set of documents spread over shard files.
//!
//! All reads and writes go against an in-memory view (id → document). Mutations
//! mark the owning shards dirty and (re)start a debounce timer; when it fires
//! the dirty shards and the metadata file are rewritten. An optional watcher
//! polls shard files and reloads any shard edited outside this process.

use crate::{
    document::{ensure_id, into_document, into_stored_document, ID_FIELD},
    error::Result,
    events::{ChangeEvent, UpdatedDocument},
    index::FieldIndex,
    metadata::{CollectionMetadata, ShardMetadata},
    query::Query,
    shard::{decode_documents, encode_documents, list_shard_files, FileStamp, Shard, ShardId},
    Document, DocumentId, Error, Options,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the per-collection change channel.
const EVENT_CAPACITY: usize = 1024;

/// A stored document and where it lives.
#[derive(Debug, Clone)]
struct Entry {
    doc: Document,
    shard: ShardId,
    /// Insertion order, used to keep shard files and results stable
    seq: u64,
}

/// Result of [`Collection::optimize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizeReport {
    pub documents: usize,
    pub shards_before: usize,
    pub shards_after: usize,
    pub removed_shards: Vec<ShardId>,
}

/// Mutable collection state, guarded by one lock.
#[derive(Debug)]
struct State {
    name: String,
    dir: PathBuf,
    options: Options,
    documents: HashMap<DocumentId, Entry>,
    shards: BTreeMap<ShardId, Shard>,
    indexes: HashMap<String, FieldIndex>,
    next_shard_id: ShardId,
    next_seq: u64,
    metadata: CollectionMetadata,
    metadata_dirty: bool,
}

impl State {
    fn load(name: String, dir: PathBuf, options: Options) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;

        let metadata = match CollectionMetadata::load(&dir) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(collection = %name, error = %e, "Unreadable metadata file, starting fresh");
                None
            }
        };
        let recovered_next = metadata.as_ref().and_then(|m| m.next_shard_id).unwrap_or(0);

        let mut state = Self {
            name,
            dir,
            options,
            documents: HashMap::new(),
            shards: BTreeMap::new(),
            indexes: HashMap::new(),
            next_shard_id: recovered_next,
            next_seq: 0,
            metadata: metadata.unwrap_or_default(),
            metadata_dirty: false,
        };
        state.indexes.insert(ID_FIELD.to_string(), FieldIndex::new(ID_FIELD));

        for (id, path) in list_shard_files(&state.dir)? {
            state.next_shard_id = state.next_shard_id.max(id + 1);

            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(collection = %state.name, shard = id, error = %e, "Failed to read shard, skipping");
                    continue;
                }
            };
            let values = match decode_documents(&bytes) {
                Ok(values) => values,
                Err(e) => {
                    error!(collection = %state.name, shard = id, error = %e, "Corrupt shard file, skipping");
                    continue;
                }
            };

            let mut shard = Shard::new(id, &state.dir);
            shard.record_generation(&bytes);
            shard.observe(FileStamp::read(&path).ok().flatten());
            state.shards.insert(id, shard);
            let (loaded, _) = state.absorb(id, values);
            debug!(collection = %state.name, shard = id, documents = loaded, "Loaded shard");
        }

        if state.shards.is_empty() {
            state.create_shard();
        }

        info!(
            collection = %state.name,
            documents = state.documents.len(),
            shards = state.shards.len(),
            "Collection opened"
        );

        Ok(state)
    }

    /// Add parsed shard contents to the in-memory view under `shard_id`.
    ///
    /// Returns how many documents were taken and whether any needed a fresh id
    /// (which makes the shard dirty).
    fn absorb(&mut self, shard_id: ShardId, values: Vec<Value>) -> (usize, bool) {
        let mut members = HashSet::new();
        let mut assigned_ids = false;

        for value in values {
            let had_string_id = value.get(ID_FIELD).is_some_and(Value::is_string);
            let mut doc = match into_stored_document(value) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(collection = %self.name, shard = shard_id, error = %e, "Skipping malformed document");
                    continue;
                }
            };
            if !had_string_id {
                assigned_ids = true;
            }
            let id = ensure_id(&mut doc);
            if self.documents.contains_key(&id) || members.contains(&id) {
                warn!(collection = %self.name, shard = shard_id, id = %id, "Duplicate document id on disk, skipping");
                continue;
            }

            self.index_document(&id, &doc);
            members.insert(id.clone());
            let seq = self.bump_seq();
            self.documents.insert(
                id,
                Entry {
                    doc,
                    shard: shard_id,
                    seq,
                },
            );
        }

        let count = members.len();
        if let Some(shard) = self.shards.get_mut(&shard_id) {
            shard.adopt(members);
            if assigned_ids {
                shard.mark_dirty();
            }
        }
        (count, assigned_ids)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Allocate a new shard and write an empty placeholder file for it.
    fn create_shard(&mut self) -> ShardId {
        let id = self.next_shard_id;
        self.next_shard_id += 1;

        let mut shard = Shard::new(id, &self.dir);
        match encode_documents(std::iter::empty::<&Document>(), self.options.compact()) {
            Ok(bytes) => {
                if let Err(e) = shard.write(&bytes) {
                    error!(collection = %self.name, shard = id, error = %e, "Failed to write shard placeholder");
                    shard.mark_dirty();
                }
            }
            Err(e) => error!(collection = %self.name, shard = id, error = %e, "Failed to encode shard placeholder"),
        }
        self.shards.insert(id, shard);
        self.metadata_dirty = true;
        debug!(collection = %self.name, shard = id, "Created shard");
        id
    }

    /// First shard, in creation order, with room for another document.
    fn route(&mut self) -> ShardId {
        let options = &self.options;
        let open = self
            .shards
            .values()
            .find(|s| s.has_capacity(options))
            .map(|s| s.id);
        match open {
            Some(id) => id,
            None => self.create_shard(),
        }
    }

    fn index_document(&mut self, id: &str, doc: &Document) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = doc.get(field) {
                index.insert(value, id);
            }
        }
    }

    fn unindex_document(&mut self, id: &str, doc: &Document) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(value) = doc.get(field) {
                index.remove(value, id);
            }
        }
    }

    fn insert(&mut self, id: DocumentId, doc: Document) {
        let estimated = serde_json::to_vec(&doc).map(|b| b.len() as u64 + 2).unwrap_or(0);
        let shard_id = self.route();
        if let Some(shard) = self.shards.get_mut(&shard_id) {
            shard.add(id.clone(), estimated);
        }
        self.index_document(&id, &doc);
        let seq = self.bump_seq();
        self.documents.insert(
            id,
            Entry {
                doc,
                shard: shard_id,
                seq,
            },
        );
        self.metadata_dirty = true;
    }

    fn remove(&mut self, id: &str) -> Option<Document> {
        let entry = self.documents.remove(id)?;
        if let Some(shard) = self.shards.get_mut(&entry.shard) {
            shard.remove(id);
        }
        self.unindex_document(id, &entry.doc);
        self.metadata_dirty = true;
        Some(entry.doc)
    }

    /// Ids matching a query, ordered by shard then insertion.
    fn matching_ids(&self, query: &Query) -> Vec<DocumentId> {
        let mut entries: Vec<(&DocumentId, &Entry)> = if query.is_empty() {
            self.documents.iter().collect()
        } else {
            let mut buckets = Vec::new();
            for (field, value) in query.index_candidates() {
                if let Some(index) = self.indexes.get(field) {
                    match index.lookup(value) {
                        Some(ids) => buckets.push(ids),
                        None => return Vec::new(),
                    }
                }
            }
            buckets.sort_by_key(|ids| ids.len());

            match buckets.split_first() {
                Some((smallest, rest)) => smallest
                    .iter()
                    .filter(|id| rest.iter().all(|other| other.contains(*id)))
                    .filter_map(|id| self.documents.get_key_value(id))
                    .filter(|(_, entry)| query.matches(&entry.doc))
                    .collect(),
                None => self
                    .documents
                    .iter()
                    .filter(|(_, entry)| query.matches(&entry.doc))
                    .collect(),
            }
        };

        entries.sort_by_key(|(_, entry)| (entry.shard, entry.seq));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn encode_shard(&self, shard: &Shard) -> Result<Vec<u8>> {
        let mut entries: Vec<&Entry> = shard
            .members()
            .iter()
            .filter_map(|id| self.documents.get(id))
            .collect();
        entries.sort_by_key(|entry| entry.seq);
        encode_documents(entries.into_iter().map(|e| &e.doc), self.options.compact())
    }

    fn has_pending_writes(&self) -> bool {
        self.metadata_dirty || self.shards.values().any(Shard::is_dirty)
    }

    /// Rewrite dirty shards and the metadata file.
    ///
    /// Every dirty shard is attempted; the first failure is returned and the
    /// failed shards stay dirty for the next flush.
    fn write_dirty(&mut self) -> Result<usize> {
        let dirty: Vec<ShardId> = self
            .shards
            .values()
            .filter(|s| s.is_dirty())
            .map(|s| s.id)
            .collect();

        let mut first_error: Option<Error> = None;
        let mut written = 0;
        for id in dirty {
            let bytes = match self.shards.get(&id).map(|shard| self.encode_shard(shard)) {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    error!(collection = %self.name, shard = id, error = %e, "Failed to encode shard");
                    first_error.get_or_insert(e);
                    continue;
                }
                None => continue,
            };
            if let Some(shard) = self.shards.get_mut(&id) {
                match shard.write(&bytes) {
                    Ok(()) => written += 1,
                    Err(e) => {
                        error!(collection = %self.name, shard = id, error = %e, "Failed to write shard");
                        first_error.get_or_insert(e.into());
                    }
                }
            }
        }

        if written > 0 || self.metadata_dirty {
            let metadata = self.snapshot_metadata();
            match metadata.save(&self.dir) {
                Ok(()) => {
                    self.metadata = metadata;
                    self.metadata_dirty = false;
                }
                Err(e) => {
                    error!(collection = %self.name, error = %e, "Failed to write metadata");
                    first_error.get_or_insert(e);
                }
            }
        }

        debug!(collection = %self.name, shards = written, "Flushed collection");
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    fn snapshot_metadata(&self) -> CollectionMetadata {
        CollectionMetadata {
            total_documents: self.documents.len(),
            total_shards: self.shards.len(),
            next_shard_id: Some(self.next_shard_id),
            created_at: self.metadata.created_at,
            last_optimized: self.metadata.last_optimized,
            shards: self
                .shards
                .values()
                .map(|s| ShardMetadata {
                    id: s.id,
                    document_count: s.document_count(),
                    file_size: s.file_size,
                    last_modified: s.last_modified,
                })
                .collect(),
        }
    }

    /// Replace a shard's in-memory contents with what is on disk.
    fn reload_shard(&mut self, shard_id: ShardId, bytes: &[u8], stamp: FileStamp) -> Result<(usize, bool)> {
        let values = decode_documents(bytes)?;

        let old_members = match self.shards.get_mut(&shard_id) {
            Some(shard) => shard.take_members(),
            None => return Ok((0, false)),
        };
        for id in old_members {
            if let Some(entry) = self.documents.remove(&id) {
                self.unindex_document(&id, &entry.doc);
            }
        }

        let (count, assigned_ids) = self.absorb(shard_id, values);
        if let Some(shard) = self.shards.get_mut(&shard_id) {
            shard.record_generation(bytes);
            shard.observe(Some(stamp));
        }
        self.metadata_dirty = true;
        Ok((count, assigned_ids))
    }
}

struct Inner {
    name: String,
    dir: PathBuf,
    options: Options,
    state: Mutex<State>,
    events: broadcast::Sender<ChangeEvent>,
    runtime: Option<Handle>,
    pending_flush: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn emit(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Cancel any pending flush timer and start a new one.
    ///
    /// Without a runtime there is no timer, so the write happens right away.
    fn schedule_flush(self: &Arc<Self>) {
        let Some(handle) = &self.runtime else {
            self.flush_logged();
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(self);
        let delay = self.options.flush_delay;
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let _ = tokio::task::spawn_blocking(move || inner.flush_logged()).await;
            }
        });

        if let Some(previous) = self.pending_flush.lock().replace(task) {
            previous.abort();
        }
    }

    fn flush(&self) -> Result<usize> {
        self.state.lock().write_dirty()
    }

    fn flush_logged(&self) {
        if let Err(e) = self.flush() {
            warn!(collection = %self.name, error = %e, "Flush failed, in-memory state retained");
        }
    }

    /// Check every shard file for edits made outside this process.
    fn poll_external_changes(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut events = Vec::new();
        let mut needs_flush = false;
        {
            let mut state = self.state.lock();
            let ids: Vec<ShardId> = state.shards.keys().copied().collect();

            for id in ids {
                let Some(shard) = state.shards.get_mut(&id) else {
                    continue;
                };
                let stamp = match FileStamp::read(&shard.path) {
                    Ok(Some(stamp)) => stamp,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(collection = %self.name, shard = id, error = %e, "Failed to stat shard");
                        continue;
                    }
                };
                if !shard.stamp_changed(&stamp) {
                    continue;
                }
                if shard.is_dirty() {
                    // Our pending write will replace the file anyway
                    debug!(collection = %self.name, shard = id, "Shard changed on disk with local writes pending");
                    continue;
                }

                let bytes = match std::fs::read(&shard.path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(collection = %self.name, shard = id, error = %e, "Failed to read changed shard");
                        continue;
                    }
                };
                if !shard.is_foreign(&bytes) {
                    shard.observe(Some(stamp));
                    continue;
                }

                match state.reload_shard(id, &bytes, stamp) {
                    Ok((documents, assigned_ids)) => {
                        info!(collection = %self.name, shard = id, documents, "Reloaded externally modified shard");
                        needs_flush |= assigned_ids;
                        events.push(ChangeEvent::Reload { shard: id, documents });
                    }
                    Err(e) => {
                        warn!(collection = %self.name, shard = id, error = %e, "Changed shard is unreadable, keeping in-memory copy");
                        if let Some(shard) = state.shards.get_mut(&id) {
                            shard.observe(Some(stamp));
                        }
                    }
                }
            }
        }

        for event in events {
            self.emit(event);
        }
        if needs_flush {
            self.schedule_flush();
        }
    }

    fn start_watcher(self: &Arc<Self>) {
        let Some(handle) = &self.runtime else {
            debug!(collection = %self.name, "No runtime, file watching disabled");
            return;
        };

        let weak = Arc::downgrade(self);
        let interval = self.options.watch_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let _ = tokio::task::spawn_blocking(move || inner.poll_external_changes()).await;
            }
        });
        *self.watcher.lock() = Some(task);
    }

    fn stop_tasks(&self) {
        if let Some(task) = self.pending_flush.lock().take() {
            task.abort();
        }
        if let Some(task) = self.watcher.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let state = self.state.get_mut();
        if state.has_pending_writes() {
            if let Err(e) = state.write_dirty() {
                error!(collection = %self.name, error = %e, "Final flush on drop failed");
            }
        }
        if let Some(task) = self.watcher.get_mut().take() {
            task.abort();
        }
    }
}

/// A named collection of JSON documents. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

impl Collection {
    /// Open (or create) a collection stored in `dir`.
    ///
    /// Every shard file is loaded into memory. When called inside a Tokio
    /// runtime, writes are debounced and (if enabled) shard files are watched;
    /// otherwise each mutation is written through immediately.
    pub fn open(name: impl Into<String>, dir: impl Into<PathBuf>, options: Options) -> Result<Self> {
        let name = name.into();
        let dir = dir.into();
        let options = options.normalized();

        let state = State::load(name.clone(), dir.clone(), options.clone())?;
        let needs_flush = state.has_pending_writes();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            name,
            dir,
            options,
            state: Mutex::new(state),
            events,
            runtime: Handle::try_current().ok(),
            pending_flush: Mutex::new(None),
            watcher: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if inner.options.watch_files {
            inner.start_watcher();
        }
        if needs_flush {
            inner.schedule_flush();
        }

        Ok(Self { inner })
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Directory holding this collection's shard files.
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    /// Options this collection was opened with.
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.events.subscribe()
    }

    /// Insert one document, assigning an `_id` if it has none.
    pub fn insert(&self, doc: Value) -> Result<Document> {
        let mut inserted = self.insert_many(vec![doc])?;
        inserted
            .pop()
            .ok_or_else(|| Error::InvalidDocument("nothing inserted".into()))
    }

    /// Insert a batch of documents.
    ///
    /// All ids are checked before anything is committed: a duplicate (against
    /// the collection or within the batch) rejects the whole batch.
    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Document>> {
        self.inner.ensure_open()?;

        let mut prepared = Vec::with_capacity(docs.len());
        for value in docs {
            let mut doc = into_document(value)?;
            let id = ensure_id(&mut doc);
            prepared.push((id, doc));
        }
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        let inserted = {
            let mut state = self.inner.state.lock();
            let mut seen = HashSet::with_capacity(prepared.len());
            for (id, _) in &prepared {
                if state.documents.contains_key(id) || !seen.insert(id.as_str()) {
                    return Err(Error::DuplicateKey(id.clone()));
                }
            }

            let mut inserted = Vec::with_capacity(prepared.len());
            for (id, doc) in prepared {
                inserted.push(doc.clone());
                state.insert(id, doc);
            }
            inserted
        };

        self.inner.emit(ChangeEvent::Insert {
            documents: inserted.clone(),
        });
        self.inner.schedule_flush();
        Ok(inserted)
    }

    /// Documents matching a query. `{}` returns everything.
    pub fn find(&self, query: &Value) -> Result<Vec<Document>> {
        let query = Query::parse(query)?;
        self.find_query(&query)
    }

    /// Documents matching a parsed query.
    pub fn find_query(&self, query: &Query) -> Result<Vec<Document>> {
        self.inner.ensure_open()?;
        let state = self.inner.state.lock();
        Ok(state
            .matching_ids(query)
            .iter()
            .filter_map(|id| state.documents.get(id))
            .map(|entry| entry.doc.clone())
            .collect())
    }

    /// First document matching a query.
    pub fn find_one(&self, query: &Value) -> Result<Option<Document>> {
        Ok(self.find(query)?.into_iter().next())
    }

    /// Direct lookup by id.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Document>> {
        self.inner.ensure_open()?;
        Ok(self
            .inner
            .state
            .lock()
            .documents
            .get(id)
            .map(|entry| entry.doc.clone()))
    }

    /// Number of documents matching a query.
    pub fn count(&self, query: &Value) -> Result<usize> {
        let query = Query::parse(query)?;
        self.inner.ensure_open()?;
        let state = self.inner.state.lock();
        if query.is_empty() {
            return Ok(state.documents.len());
        }
        Ok(state.matching_ids(&query).len())
    }

    /// Shallow-merge `patch` into every matching document. Returns the match count.
    ///
    /// `patch` may repeat a document's own `_id` but never change it.
    pub fn update(&self, query: &Value, patch: &Value) -> Result<usize> {
        let query = Query::parse(query)?;
        let patch = patch
            .as_object()
            .ok_or_else(|| Error::InvalidDocument("update patch must be an object".into()))?;
        self.inner.ensure_open()?;

        let changes = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let ids = state.matching_ids(&query);

            if let Some(new_id) = patch.get(ID_FIELD) {
                if let Some(id) = ids.iter().find(|id| new_id.as_str() != Some(id.as_str())) {
                    return Err(Error::ImmutableId(id.clone()));
                }
            }

            let mut changes = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(entry) = state.documents.get_mut(&id) else {
                    continue;
                };
                let before = entry.doc.clone();

                for (field, value) in patch.iter().filter(|(field, _)| *field != ID_FIELD) {
                    let old = entry.doc.insert(field.clone(), value.clone());
                    if old.as_ref() == Some(value) {
                        continue;
                    }
                    if let Some(index) = state.indexes.get_mut(field) {
                        if let Some(old) = &old {
                            index.remove(old, &id);
                        }
                        index.insert(value, &id);
                    }
                }

                if let Some(shard) = state.shards.get_mut(&entry.shard) {
                    shard.mark_dirty();
                }
                changes.push(UpdatedDocument {
                    before,
                    after: entry.doc.clone(),
                });
            }
            changes
        };

        let count = changes.len();
        if count > 0 {
            self.inner.emit(ChangeEvent::Update { changes, count });
            self.inner.schedule_flush();
        }
        Ok(count)
    }

    /// Remove every matching document. Returns how many were removed.
    pub fn delete(&self, query: &Value) -> Result<usize> {
        let query = Query::parse(query)?;
        self.inner.ensure_open()?;

        let removed: Vec<Document> = {
            let mut state = self.inner.state.lock();
            let ids = state.matching_ids(&query);
            ids.iter().filter_map(|id| state.remove(id)).collect()
        };

        let count = removed.len();
        if count > 0 {
            self.inner.emit(ChangeEvent::Delete {
                documents: removed,
                count,
            });
            self.inner.schedule_flush();
        }
        Ok(count)
    }

    /// Build an equality index on `field` if there is none. Returns whether one was built.
    pub fn ensure_index(&self, field: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.indexes.contains_key(field) {
            return Ok(false);
        }

        let mut index = FieldIndex::new(field);
        for (id, entry) in &state.documents {
            if let Some(value) = entry.doc.get(field) {
                index.insert(value, id);
            }
        }
        debug!(collection = %self.inner.name, field, values = index.len(), "Built field index");
        state.indexes.insert(field.to_string(), index);
        Ok(true)
    }

    /// Alias of [`Collection::ensure_index`].
    pub fn create_index(&self, field: &str) -> Result<bool> {
        self.ensure_index(field)
    }

    /// Indexed field names, sorted.
    pub fn indexed_fields(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut fields: Vec<String> = state.indexes.keys().cloned().collect();
        fields.sort();
        fields
    }

    /// Number of distinct values in a field's index.
    pub fn index_size(&self, field: &str) -> Option<usize> {
        self.inner.state.lock().indexes.get(field).map(FieldIndex::len)
    }

    /// Whether any index still references `id`.
    pub fn is_indexed(&self, id: &str) -> bool {
        self.inner
            .state
            .lock()
            .indexes
            .values()
            .any(|index| index.contains_id(id))
    }

    /// Redistribute documents evenly over as few shards as the caps allow.
    ///
    /// Shards left empty are deleted from disk (the lowest shard is always
    /// kept). The result is written immediately.
    pub fn optimize(&self) -> Result<OptimizeReport> {
        self.inner.ensure_open()?;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let total = state.documents.len();
        let shards_before = state.shards.len();
        let max_docs = state.options.max_documents_per_file;
        let target_shards = total.div_ceil(max_docs).max(1);
        let per_shard = total.div_ceil(target_shards).max(1);

        let mut order: Vec<(DocumentId, ShardId, u64)> = state
            .documents
            .iter()
            .map(|(id, entry)| (id.clone(), entry.shard, entry.seq))
            .collect();
        order.sort_by_key(|(_, shard, seq)| (*shard, *seq));

        let mut shard_ids: Vec<ShardId> = state.shards.keys().copied().collect();
        while shard_ids.len() < target_shards {
            shard_ids.push(state.create_shard());
        }
        for shard in state.shards.values_mut() {
            shard.take_members();
            shard.file_size = 0;
        }

        let mut seq = 0;
        for (chunk, target) in order.chunks(per_shard).zip(&shard_ids) {
            for (id, _, _) in chunk {
                if let Some(entry) = state.documents.get_mut(id) {
                    entry.shard = *target;
                    entry.seq = seq;
                    seq += 1;
                    let estimated = serde_json::to_vec(&entry.doc).map(|b| b.len() as u64 + 2).unwrap_or(0);
                    if let Some(shard) = state.shards.get_mut(target) {
                        shard.add(id.clone(), estimated);
                    }
                }
            }
        }
        state.next_seq = seq;

        let keep = shard_ids.first().copied();
        let empty: Vec<ShardId> = state
            .shards
            .values()
            .filter(|s| s.document_count() == 0 && Some(s.id) != keep)
            .map(|s| s.id)
            .collect();
        let stale: Vec<(ShardId, PathBuf)> = empty
            .iter()
            .filter_map(|id| state.shards.remove(id).map(|shard| (*id, shard.path)))
            .collect();

        state.metadata.last_optimized = Some(Utc::now());
        state.metadata_dirty = true;
        // Old files stay on disk until their documents are written elsewhere
        state.write_dirty()?;

        for (id, path) in stale {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(collection = %self.inner.name, shard = id, error = %e, "Failed to remove empty shard");
                }
            }
        }

        info!(
            collection = %self.inner.name,
            documents = total,
            shards_before,
            shards_after = state.shards.len(),
            "Optimized collection"
        );

        Ok(OptimizeReport {
            documents: total,
            shards_before,
            shards_after: state.shards.len(),
            removed_shards: empty,
        })
    }

    /// Write pending changes now instead of waiting for the debounce timer.
    pub fn flush(&self) -> Result<()> {
        if let Some(task) = self.inner.pending_flush.lock().take() {
            task.abort();
        }
        self.inner.flush().map(|_| ())
    }

    /// Check shard files for external edits right away.
    pub fn check_for_changes(&self) {
        self.inner.poll_external_changes();
    }

    /// Current metadata summary (what the next flush would write).
    pub fn stats(&self) -> CollectionMetadata {
        self.inner.state.lock().snapshot_metadata()
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.inner.state.lock().shards.len()
    }

    /// Whether changes are waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        self.inner.state.lock().has_pending_writes()
    }

    /// Whether [`Collection::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop background tasks and write everything out. Further calls fail with
    /// [`Error::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.stop_tasks();
        let result = self.inner.flush();
        info!(collection = %self.inner.name, "Collection closed");
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open(dir: &Path) -> Collection {
        Collection::open("users", dir, Options::default().with_watch_files(false)).unwrap()
    }

    fn ids(docs: &[Document]) -> Vec<&str> {
        docs.iter()
            .filter_map(|d| d.get(ID_FIELD).and_then(Value::as_str))
            .collect()
    }

    #[test]
    fn open_creates_placeholder_shard() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        assert_eq!(users.shard_count(), 1);
        assert!(dir.path().join("shard_0.json").exists());
        assert_eq!(users.indexed_fields(), vec!["_id".to_string()]);
    }

    #[test]
    fn insert_assigns_id() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());

        let doc = users.insert(json!({"name": "Alice"})).unwrap();
        let id = doc[ID_FIELD].as_str().unwrap();
        assert_eq!(id.len(), 24);
        assert_eq!(users.find_by_id(id).unwrap().unwrap(), doc);
    }

    #[test]
    fn duplicate_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "a", "v": 1})).unwrap();

        let result = users.insert(json!({"_id": "a", "v": 2}));
        assert!(matches!(result, Err(Error::DuplicateKey(id)) if id == "a"));
        assert_eq!(users.find_by_id("a").unwrap().unwrap()["v"], json!(1));
    }

    #[test]
    fn batch_insert_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "taken"})).unwrap();

        let result = users.insert_many(vec![json!({"_id": "new"}), json!({"_id": "taken"})]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert!(users.find_by_id("new").unwrap().is_none());

        let result = users.insert_many(vec![json!({"_id": "x"}), json!({"_id": "x"})]);
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert_eq!(users.count(&json!({})).unwrap(), 1);
    }

    #[test]
    fn update_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "x", "a": 0, "b": 2})).unwrap();

        let count = users.update(&json!({"_id": "x"}), &json!({"a": 1})).unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            Value::Object(users.find_by_id("x").unwrap().unwrap()),
            json!({"_id": "x", "a": 1, "b": 2})
        );
    }

    #[test]
    fn update_cannot_change_id() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "x", "a": 0})).unwrap();

        let result = users.update(&json!({"_id": "x"}), &json!({"_id": "y"}));
        assert!(matches!(result, Err(Error::ImmutableId(_))));

        // Repeating the same id is harmless
        assert_eq!(users.update(&json!({"_id": "x"}), &json!({"_id": "x", "a": 5})).unwrap(), 1);
    }

    #[test]
    fn update_moves_index_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.ensure_index("team").unwrap();
        users
            .insert_many(vec![
                json!({"_id": "a", "team": "red"}),
                json!({"_id": "b", "team": "red"}),
            ])
            .unwrap();

        users.update(&json!({"_id": "a"}), &json!({"team": "blue"})).unwrap();
        assert_eq!(ids(&users.find(&json!({"team": "red"})).unwrap()), vec!["b"]);
        assert_eq!(ids(&users.find(&json!({"team": "blue"})).unwrap()), vec!["a"]);

        users.update(&json!({"_id": "b"}), &json!({"team": "blue"})).unwrap();
        assert_eq!(users.index_size("team"), Some(1));
    }

    #[test]
    fn delete_removes_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.ensure_index("name").unwrap();
        users
            .insert_many(vec![json!({"_id": "a", "name": "x"}), json!({"_id": "b", "name": "y"})])
            .unwrap();

        assert_eq!(users.delete(&json!({"_id": "a"})).unwrap(), 1);
        assert!(users.find_by_id("a").unwrap().is_none());
        assert_eq!(users.count(&json!({})).unwrap(), 1);
        assert!(!users.is_indexed("a"));
        assert_eq!(users.delete(&json!({"_id": "a"})).unwrap(), 0);
    }

    #[test]
    fn multi_field_queries_use_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.ensure_index("owner").unwrap();
        users.ensure_index("name").unwrap();
        users
            .insert_many(vec![
                json!({"_id": "1", "owner": "u1", "name": "mix", "n": 1}),
                json!({"_id": "2", "owner": "u1", "name": "rock", "n": 2}),
                json!({"_id": "3", "owner": "u2", "name": "mix", "n": 3}),
            ])
            .unwrap();

        let found = users.find(&json!({"owner": "u1", "name": "mix"})).unwrap();
        assert_eq!(ids(&found), vec!["1"]);

        let found = users.find(&json!({"owner": "u1", "n": {"$gt": 1}})).unwrap();
        assert_eq!(ids(&found), vec!["2"]);

        assert!(users.find(&json!({"owner": "nobody"})).unwrap().is_empty());
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "a", "k": 1})).unwrap();

        assert!(users.ensure_index("k").unwrap());
        assert!(!users.create_index("k").unwrap());
        assert_eq!(users.index_size("k"), Some(1));
    }

    #[test]
    fn find_returns_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        for i in 0..5 {
            users.insert(json!({"_id": format!("d{i}")})).unwrap();
        }
        assert_eq!(
            ids(&users.find(&json!({})).unwrap()),
            vec!["d0", "d1", "d2", "d3", "d4"]
        );
        assert_eq!(users.find_one(&json!({})).unwrap().unwrap()[ID_FIELD], json!("d0"));
    }

    #[test]
    fn writes_through_without_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.insert(json!({"_id": "a"})).unwrap();
        assert!(!users.has_pending_writes());

        let on_disk = std::fs::read_to_string(dir.path().join("shard_0.json")).unwrap();
        assert!(on_disk.contains("\"a\""));
        assert!(dir.path().join("metadata.json").exists());
    }

    #[test]
    fn corrupt_shard_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shard_0.json"), "[{\"_id\": \"a\"}]").unwrap();
        std::fs::write(dir.path().join("shard_1.json"), "[{oops").unwrap();

        let users = open(dir.path());
        assert_eq!(users.count(&json!({})).unwrap(), 1);
        assert_eq!(users.shard_count(), 1);

        // The corrupt file is left alone and its id is not reused
        users.optimize().unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("shard_1.json")).unwrap(),
            "[{oops"
        );
        assert_eq!(users.stats().next_shard_id, Some(2));
    }

    #[test]
    fn numeric_ids_on_disk_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("shard_0.json"), r#"[{"_id": 7, "name": "x"}]"#).unwrap();

        let users = open(dir.path());
        assert_eq!(users.find_by_id("7").unwrap().unwrap()["name"], json!("x"));
        assert!(!users.has_pending_writes());

        let on_disk = std::fs::read_to_string(dir.path().join("shard_0.json")).unwrap();
        assert!(on_disk.contains("\"7\""));
    }

    #[test]
    fn closed_collection_rejects_calls() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        users.close().unwrap();
        assert!(users.is_closed());
        assert!(matches!(users.insert(json!({})), Err(Error::Closed(_))));
        assert!(matches!(users.find(&json!({})), Err(Error::Closed(_))));
        users.close().unwrap();
    }

    #[test]
    fn invalid_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let users = open(dir.path());
        assert!(matches!(users.insert(json!(42)), Err(Error::InvalidDocument(_))));
        assert!(matches!(users.find(&json!([1])), Err(Error::InvalidQuery(_))));
        assert!(matches!(
            users.update(&json!({}), &json!("x")),
            Err(Error::InvalidDocument(_))
        ));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeMap;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(u8, u8),
            Update(u8, u8),
            Delete(u8),
        }

        fn arb_op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..16, 0u8..3).prop_map(|(id, team)| Op::Insert(id, team)),
                (0u8..16, 0u8..3).prop_map(|(id, team)| Op::Update(id, team)),
                (0u8..16).prop_map(Op::Delete),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn prop_index_agrees_with_scan(ops in prop::collection::vec(arb_op(), 1..40)) {
                let dir = tempfile::tempdir().unwrap();
                let users = Collection::open(
                    "users",
                    dir.path(),
                    Options::default().with_watch_files(false).with_max_documents_per_file(4),
                )
                .unwrap();
                users.ensure_index("team").unwrap();
                let mut model: BTreeMap<String, u8> = BTreeMap::new();

                for op in ops {
                    match op {
                        Op::Insert(id, team) => {
                            let id = format!("d{id}");
                            let result = users.insert(json!({"_id": id, "team": team, "shadow": team}));
                            if model.contains_key(&id) {
                                prop_assert!(matches!(result, Err(Error::DuplicateKey(_))));
                            } else {
                                prop_assert!(result.is_ok());
                                model.insert(id, team);
                            }
                        }
                        Op::Update(id, team) => {
                            let id = format!("d{id}");
                            let count = users
                                .update(&json!({"_id": id}), &json!({"team": team, "shadow": team}))
                                .unwrap();
                            prop_assert_eq!(count, usize::from(model.contains_key(&id)));
                            if let Some(current) = model.get_mut(&id) {
                                *current = team;
                            }
                        }
                        Op::Delete(id) => {
                            let id = format!("d{id}");
                            let count = users.delete(&json!({"_id": id})).unwrap();
                            prop_assert_eq!(count, usize::from(model.remove(&id).is_some()));
                        }
                    }
                }

                prop_assert_eq!(users.count(&json!({})).unwrap(), model.len());
                for team in 0u8..3 {
                    let expected = model.values().filter(|t| **t == team).count();
                    let indexed = users.find(&json!({"team": team})).unwrap();
                    let scanned = users.find(&json!({"shadow": team})).unwrap();
                    prop_assert_eq!(indexed.len(), expected);
                    prop_assert_eq!(ids(&indexed), ids(&scanned));
                }
                for id in model.keys() {
                    prop_assert!(users.is_indexed(id));
                }
                let total: usize = users.stats().shards.iter().map(|s| s.document_count).sum();
                prop_assert_eq!(total, model.len());
            }
        }
    }
}
