//! # Shelf Engine
//!
//! An embedded, sharded JSON document store for local persistence.
//!
//! Documents are schema-free JSON objects keyed by a string `_id`. Each
//! collection keeps every document in memory and persists them across a set
//! of bounded shard files, so a single large collection never turns into one
//! huge file that has to be rewritten on every change.
//!
//! ## Design Principles
//!
//! - **Memory first**: every read is served from memory; disk is written behind
//! - **Debounced writes**: bursts of mutations collapse into one flush
//! - **Schema-agnostic**: validation is left to callers
//! - **Single process**: one writer per directory, with best-effort detection
//!   of external edits
//!
//! ## On-disk Layout
//!
//! ```text
//! <root>/<collection>/shard_0.json   -- JSON array of documents
//! <root>/<collection>/shard_1.json
//! <root>/<collection>/metadata.json  -- shard counts, sizes, timestamps
//! ```
//!
//! A legacy `<root>/<collection>.json` flat array is migrated into this layout
//! the first time the collection is opened through a [`Store`].
//!
//! ## Core Concepts
//!
//! ### Collections
//!
//! A [`Collection`] offers insert, find, update, delete and count over JSON
//! queries (see [`Query`]). New documents go to the first shard under both
//! caps in [`Options`]; a new shard is created when none qualifies.
//!
//! ### Field indices
//!
//! [`Collection::ensure_index`] builds a [`FieldIndex`] used for equality
//! lookups. Queries combining several indexed equalities intersect their
//! buckets before scanning.
//!
//! ### Change events
//!
//! Every mutation emits a [`ChangeEvent`]; the [`Store`] re-emits them as
//! [`CollectionChange`]s.
//!
//! ## Quick Start
//!
//! ```rust
//! use shelf_engine::{Collection, Options};
//! use serde_json::json;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let options = Options::default().with_watch_files(false);
//! let users = Collection::open("users", dir.path(), options).unwrap();
//!
//! users.insert(json!({"_id": "u1", "name": "Alice", "age": 30})).unwrap();
//! users.insert(json!({"name": "Bob", "age": 17})).unwrap();
//!
//! let adults = users.find(&json!({"age": {"$gte": 18}})).unwrap();
//! assert_eq!(adults.len(), 1);
//!
//! users.update(&json!({"_id": "u1"}), &json!({"age": 31})).unwrap();
//! assert_eq!(users.find_by_id("u1").unwrap().unwrap()["age"], 31);
//! ```

pub mod collection;
pub mod document;
pub mod error;
pub mod events;
pub mod index;
pub mod metadata;
pub mod migrate;
pub mod options;
pub mod query;
pub mod shard;
pub mod store;

// Re-export main types at crate root
pub use collection::{Collection, OptimizeReport};
pub use document::{generate_id, Document, ID_FIELD};
pub use error::{Error, Result};
pub use events::{ChangeEvent, ChangeKind, CollectionChange, UpdatedDocument};
pub use index::{FieldIndex, IndexKey};
pub use metadata::{CollectionMetadata, ShardMetadata};
pub use options::Options;
pub use query::{Condition, Operator, Query};
pub use shard::ShardId;
pub use store::Store;

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
