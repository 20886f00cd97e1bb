//! Field indices: value → set of document ids, maintained incrementally.

use crate::DocumentId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Hashable form of a JSON value.
///
/// Numbers are keyed by their `f64` value so `1` and `1.0` share a bucket,
/// matching query equality. Arrays and objects are keyed by their JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(u64),
    String(String),
    Composite(String),
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                // -0.0 and 0.0 compare equal, so they must hash equal
                Some(f) if f == 0.0 => IndexKey::Number(0f64.to_bits()),
                Some(f) => IndexKey::Number(f.to_bits()),
                None => IndexKey::Composite(n.to_string()),
            },
            Value::String(s) => IndexKey::String(s.clone()),
            other => IndexKey::Composite(other.to_string()),
        }
    }
}

/// An equality index over one field.
#[derive(Debug, Clone, Default)]
pub struct FieldIndex {
    field: String,
    buckets: HashMap<IndexKey, HashSet<DocumentId>>,
}

impl FieldIndex {
    /// Create an empty index for a field.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            buckets: HashMap::new(),
        }
    }

    /// The indexed field name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Add a document id under a value.
    pub fn insert(&mut self, value: &Value, id: &str) {
        self.buckets
            .entry(IndexKey::from(value))
            .or_default()
            .insert(id.to_string());
    }

    /// Remove a document id from a value's bucket, dropping the bucket if it empties.
    pub fn remove(&mut self, value: &Value, id: &str) {
        let key = IndexKey::from(value);
        if let Some(ids) = self.buckets.get_mut(&key) {
            ids.remove(id);
            if ids.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    /// Ids of documents whose field equals `value`.
    pub fn lookup(&self, value: &Value) -> Option<&HashSet<DocumentId>> {
        self.buckets.get(&IndexKey::from(value))
    }

    /// Whether any bucket still holds `id`.
    pub fn contains_id(&self, id: &str) -> bool {
        self.buckets.values().any(|ids| ids.contains(id))
    }

    /// Number of distinct values.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
