//! Maintenance operations behind the `shelf` command.

use crate::error::{DataError, Result};
use serde_json::{json, Value};
use shelf_engine::Store;

/// Document and shard summary of a collection.
pub fn stats(store: &Store, collection: &str) -> Result<Value> {
    let collection = store.collection(collection)?;
    let metadata = collection.stats();
    Ok(json!({
        "collection": collection.name(),
        "indexes": collection.indexed_fields(),
        "metadata": metadata,
    }))
}

/// Rebalance a collection's shards.
pub fn optimize(store: &Store, collection: &str) -> Result<Value> {
    let report = store.collection(collection)?.optimize()?;
    Ok(json!({
        "documents": report.documents,
        "shardsBefore": report.shards_before,
        "shardsAfter": report.shards_after,
        "removedShards": report.removed_shards,
    }))
}

/// Documents matching `query` (a JSON object), or all of them.
pub fn dump(store: &Store, collection: &str, query: Option<&str>) -> Result<Vec<Value>> {
    let query: Value = match query {
        Some(text) => serde_json::from_str(text)
            .map_err(|e| DataError::InvalidInput(format!("query is not valid JSON: {e}")))?,
        None => json!({}),
    };
    Ok(store
        .collection(collection)?
        .find(&query)?
        .into_iter()
        .map(Value::Object)
        .collect())
}

/// Build an index on `field` and report its distinct value count.
pub fn reindex(store: &Store, collection: &str, field: &str) -> Result<Value> {
    let collection = store.collection(collection)?;
    let created = collection.ensure_index(field)?;
    Ok(json!({
        "field": field,
        "created": created,
        "distinctValues": collection.index_size(field).unwrap_or(0),
    }))
}
