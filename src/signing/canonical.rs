//! Deterministic JSON canonicalization applied before signing.
//!
//! Object keys are sorted ascending (byte-wise) at every nesting level;
//! array order is preserved. The serialized form is compact JSON, matching
//! `JSON.stringify` on key-sorted input so signatures verify across peers.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Rebuild a JSON value with object keys sorted at every level
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical string form of a JSON value
pub fn canonical_string(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonicalize(value))?)
}

/// Canonical string form of any serializable payload
pub fn canonical_payload<T: Serialize>(payload: &T) -> Result<String> {
    canonical_string(&serde_json::to_value(payload)?)
}
