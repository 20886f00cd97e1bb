//! Change notifications emitted by collections and the store.

use crate::{shard::ShardId, CollectionName, Document};
use serde::{Deserialize, Serialize};

/// Kind of change, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Reload,
}

/// A document before and after an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedDocument {
    pub before: Document,
    pub after: Document,
}

/// A change to one collection.
///
/// Serialized as `{"eventType": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data", rename_all = "lowercase")]
pub enum ChangeEvent {
    Insert {
        documents: Vec<Document>,
    },
    Update {
        changes: Vec<UpdatedDocument>,
        count: usize,
    },
    Delete {
        documents: Vec<Document>,
        count: usize,
    },
    /// A shard was re-read after an external edit
    Reload {
        shard: ShardId,
        documents: usize,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
            ChangeEvent::Reload { .. } => ChangeKind::Reload,
        }
    }
}

/// A collection change as forwarded by the store, tagged with its collection.
///
/// Serialized flat: `{"collection": "...", "eventType": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionChange {
    pub collection: CollectionName,
    #[serde(flatten)]
    pub event: ChangeEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_event_type_tag() {
        let event = ChangeEvent::Delete {
            documents: vec![],
            count: 0,
        };
        assert_eq!(event.kind(), ChangeKind::Delete);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({"eventType": "delete", "data": {"documents": [], "count": 0}})
        );
    }

    #[test]
    fn collection_change_is_flat() {
        let change = CollectionChange {
            collection: "playlists".to_string(),
            event: ChangeEvent::Insert {
                documents: vec![json!({"_id": "p1"}).as_object().cloned().unwrap()],
            },
        };

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(
            json,
            json!({
                "collection": "playlists",
                "eventType": "insert",
                "data": {"documents": [{"_id": "p1"}]}
            })
        );

        let back: CollectionChange = serde_json::from_value(json).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn reload_kind() {
        let event = ChangeEvent::Reload {
            shard: 2,
            documents: 7,
        };
        assert_eq!(event.kind(), ChangeKind::Reload);
    }
}
