//! Documents: schema-free JSON objects with a reserved `_id` field.

use crate::{error::Result, DocumentId, Error};
use rand::RngCore;
use serde_json::{Map, Value};

/// Name of the identifier field every stored document carries.
pub const ID_FIELD: &str = "_id";

/// Number of random bytes in a generated id (hex-encoded to twice as many chars).
const ID_BYTES: usize = 12;

/// A stored document: an arbitrary JSON object.
pub type Document = Map<String, Value>;

/// Generate a random, non-sequential document id.
pub fn generate_id() -> DocumentId {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Get the id of a document, if it has a string `_id`.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Convert a JSON value into a document.
///
/// Fails unless the value is an object whose `_id`, when present, is a string.
pub fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(doc) => {
            match doc.get(ID_FIELD) {
                None | Some(Value::String(_)) => {}
                Some(other) => {
                    return Err(Error::InvalidDocument(format!(
                        "'{}' must be a string, got {}",
                        ID_FIELD,
                        type_name(other)
                    )))
                }
            }
            Ok(doc)
        }
        other => Err(Error::InvalidDocument(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

/// Convert a document read from disk.
///
/// Files written by older tools may carry numeric or boolean ids; those are
/// kept under their string form (`1` becomes `"1"`). A null id counts as
/// missing. Array and object ids are still rejected.
pub fn into_stored_document(mut value: Value) -> Result<Document> {
    if let Value::Object(doc) = &mut value {
        let normalized = match doc.get(ID_FIELD) {
            Some(Value::Number(n)) => Some(Value::String(n.to_string())),
            Some(Value::Bool(b)) => Some(Value::String(b.to_string())),
            _ => None,
        };
        if let Some(id) = normalized {
            doc.insert(ID_FIELD.to_string(), id);
        }
        if doc.get(ID_FIELD).is_some_and(Value::is_null) {
            doc.remove(ID_FIELD);
        }
    }
    into_document(value)
}

/// Make sure a document has an id, generating one if needed. Returns the id.
pub fn ensure_id(doc: &mut Document) -> DocumentId {
    if let Some(id) = document_id(doc) {
        return id.to_string();
    }
    let id = generate_id();
    doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    id
}

/// Recursively drop empty arrays and empty objects from a document.
///
/// Used by compact shard encoding. The id field is always kept.
pub fn strip_empty(doc: &Document) -> Document {
    doc.iter()
        .filter_map(|(key, value)| {
            if key == ID_FIELD {
                return Some((key.clone(), value.clone()));
            }
            strip_value(value).map(|v| (key.clone(), v))
        })
        .collect()
}

fn strip_value(value: &Value) -> Option<Value> {
    match value {
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(strip_value).collect(),
        )),
        Value::Object(map) => {
            let stripped: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| strip_value(v).map(|v| (k.clone(), v)))
                .collect();
            if stripped.is_empty() {
                None
            } else {
                Some(Value::Object(stripped))
            }
        }
        other => Some(other.clone()),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
