//! Store - owns the collections under one database root.
//!
//! Collections are opened lazily on first access and cached. Each one lives in
//! `<root>/<name>/`; a pre-sharding `<root>/<name>.json` file is migrated into
//! that directory the first time the collection is requested. Change events
//! from every collection are re-emitted on the store, tagged with the
//! collection name.

use crate::{
    error::Result,
    events::{ChangeEvent, CollectionChange},
    migrate::{legacy_path, migrate_legacy_file},
    Collection, Error, Options,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Capacity of the store-wide change channel.
const EVENT_CAPACITY: usize = 4096;

/// The top-level document store.
pub struct Store {
    root: PathBuf,
    options: Options,
    runtime: Handle,
    collections: DashMap<String, Collection>,
    /// Shutdown signal per forwarder task. Sending (or dropping) it makes the
    /// task forward what the collection already emitted and exit.
    forwarders: DashMap<String, oneshot::Sender<()>>,
    events: broadcast::Sender<CollectionChange>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("collections", &self.collection_names())
            .finish()
    }
}

impl Store {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(root: impl Into<PathBuf>, options: Options) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        info!(root = %root.display(), "Store opened");

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            options: options.normalized(),
            runtime,
            collections: DashMap::new(),
            forwarders: DashMap::new(),
            events,
            closed: AtomicBool::new(false),
        })
    }

    /// Database root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Options applied to every collection.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Subscribe to changes from every collection.
    pub fn subscribe(&self) -> broadcast::Receiver<CollectionChange> {
        self.events.subscribe()
    }

    /// Get a collection, opening (and if necessary migrating) it on first use.
    ///
    /// A cached collection that was closed directly is replaced by a fresh one.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.root.display().to_string()));
        }
        validate_name(name)?;

        if let Some(existing) = self.collections.get(name) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        match self.collections.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(entry.get().clone());
                }
                debug!(collection = %name, "Cached collection was closed, reopening");
                let collection = self.open_collection(name)?;
                entry.insert(collection.clone());
                Ok(collection)
            }
            Entry::Vacant(entry) => {
                let collection = self.open_collection(name)?;
                entry.insert(collection.clone());
                Ok(collection)
            }
        }
    }

    /// Names of the collections opened so far, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Flush every open collection now.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for entry in self.collections.iter() {
            if let Err(e) = entry.value().flush() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every collection and release them.
    ///
    /// Pending writes are flushed and changes still inside the debounce window
    /// are forwarded to subscribers. The store rejects further use.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error = None;
        for entry in self.collections.iter() {
            if let Err(e) = entry.value().close() {
                error!(collection = %entry.key(), error = %e, "Failed to close collection");
                first_error.get_or_insert(e);
            }
        }
        self.collections.clear();

        let names: Vec<String> = self.forwarders.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, shutdown)) = self.forwarders.remove(&name) {
                let _ = shutdown.send(());
            }
        }

        info!(root = %self.root.display(), "Store closed");
        first_error.map_or(Ok(()), Err)
    }

    fn open_collection(&self, name: &str) -> Result<Collection> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;

        let legacy = legacy_path(&self.root, name);
        match migrate_legacy_file(&legacy, &dir, self.options.compact()) {
            Ok(Some(count)) => {
                info!(collection = %name, documents = count, "Migrated legacy collection file")
            }
            Ok(None) => {}
            Err(e) => {
                error!(collection = %name, error = %e, "Legacy migration failed, continuing without it")
            }
        }

        let collection = Collection::open(name, dir, self.options.clone())?;
        self.forward(&collection);
        Ok(collection)
    }

    fn forward(&self, collection: &Collection) {
        let name = collection.name().to_string();
        let receiver = collection.subscribe();
        let sender = self.events.clone();
        let debounce = self.options.change_debounce;
        let (shutdown, stop) = oneshot::channel();

        self.runtime
            .spawn(forward_changes(name.clone(), receiver, sender, debounce, stop));
        if let Some(previous) = self.forwarders.insert(name, shutdown) {
            let _ = previous.send(());
        }
    }
}

/// Re-emit a collection's events on the store channel.
///
/// Events are buffered until the collection has been quiet for `debounce`,
/// then forwarded in order. On `stop` (or when the store goes away) whatever
/// is already queued is forwarded before the task exits. Nothing is dropped.
async fn forward_changes(
    name: String,
    mut receiver: broadcast::Receiver<ChangeEvent>,
    sender: broadcast::Sender<CollectionChange>,
    debounce: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let mut buffer = Vec::new();

    loop {
        tokio::select! {
            next = receiver.recv() => match next {
                Ok(event) => buffer.push(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(collection = %name, skipped, "Change forwarder lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(debounce), if !buffer.is_empty() => {
                publish(&name, &sender, &mut buffer);
            }
            _ = &mut stop => {
                loop {
                    match receiver.try_recv() {
                        Ok(event) => buffer.push(event),
                        Err(TryRecvError::Lagged(skipped)) => {
                            warn!(collection = %name, skipped, "Change forwarder lagged");
                        }
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }

    publish(&name, &sender, &mut buffer);
}

fn publish(name: &str, sender: &broadcast::Sender<CollectionChange>, buffer: &mut Vec<ChangeEvent>) {
    for event in buffer.drain(..) {
        // No subscribers is fine
        let _ = sender.send(CollectionChange {
            collection: name.to_string(),
            event,
        });
    }
}

/// Collection names become directory names, so keep them to one plain path segment.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCollectionName(name.to_string()))
    }
}
