//! Deterministic content hashing for drift detection.
//!
//! The canonical form must match byte for byte what the remote authority
//! computes: object keys sorted at every level, compact `,`/`:` separators,
//! and volatile bookkeeping fields removed from the top-level object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::TaskId;

/// Fields that change without the task itself changing. Never hashed and
/// never sent to the remote service.
pub const VOLATILE_FIELDS: &[&str] = &[
    "checksum",
    "cached_at",
    "last_synced_at",
    "sync_state",
    "_sync_status",
    "retry_count",
    "last_error",
    "provisional_id",
];

/// Hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    pub const INVALID: &'static str = "invalid";

    /// Sentinel returned when hashing could not be performed. It matches
    /// nothing, so callers fall back to treating the data as drifted.
    pub fn invalid() -> Self {
        Self(Self::INVALID.to_string())
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn is_valid(&self) -> bool {
        self.0 != Self::INVALID && !self.0.is_empty()
    }

    pub fn matches(&self, other: &Checksum) -> bool {
        self.is_valid() && other.is_valid() && self.0 == other.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strips volatile fields and sorts object keys recursively. Idempotent.
pub fn canonicalize(entity: &Value) -> Value {
    match entity {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(key, _)| !VOLATILE_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), sort_keys(value)))
                .collect(),
        ),
        other => sort_keys(other),
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&fields[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Compact JSON text with keys written in sorted order regardless of how
/// the map stores them.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&fields[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn hash_value(entity: &Value) -> Checksum {
    Checksum(digest_hex(canonical_json(&canonicalize(entity)).as_bytes()))
}

/// Content hash of any serializable entity, or the invalid sentinel when it
/// cannot be represented as JSON.
pub fn hash_entity<T: Serialize + ?Sized>(entity: &T) -> Checksum {
    match serde_json::to_value(entity) {
        Ok(value) => hash_value(&value),
        Err(_) => Checksum::invalid(),
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum IdentityKey {
    Known(TaskId),
    Unknown(String),
}

fn identity_key(value: &Value) -> IdentityKey {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    match TaskId::from_value(&id) {
        Ok(task_id) => IdentityKey::Known(task_id),
        Err(_) => IdentityKey::Unknown(canonical_json(&canonicalize(value))),
    }
}

/// Two-level digest of a collection: entities sorted by identity, hashed
/// individually, hex digests concatenated and hashed once more.
pub fn hash_collection<T: Serialize>(entities: &[T]) -> Checksum {
    let mut keyed = Vec::with_capacity(entities.len());
    for entity in entities {
        let Ok(value) = serde_json::to_value(entity) else {
            return Checksum::invalid();
        };
        keyed.push((identity_key(&value), hash_value(&value)));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1 .0.cmp(&b.1 .0)));

    let concatenated: String = keyed.iter().map(|(_, checksum)| checksum.as_str()).collect();
    Checksum(digest_hex(concatenated.as_bytes()))
}

/// Removes internal-only fields before a payload leaves the device.
pub fn sanitize_for_remote(value: Value) -> Value {
    match value {
        Value::Object(mut fields) => {
            for key in VOLATILE_FIELDS {
                fields.remove(*key);
            }
            Value::Object(fields)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Task;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [ {"y": 2, "x": 1} ], "c": null}});
        assert_eq!(
            canonical_json(&canonicalize(&value)),
            r#"{"a":{"c":null,"z":[{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_volatile_fields_do_not_affect_hash() {
        let plain = json!({"id": 1, "title": "a"});
        let noisy = json!({"id": 1, "title": "a", "checksum": "abc", "cached_at": 99});
        assert_eq!(hash_value(&plain), hash_value(&noisy));
        assert_ne!(hash_value(&plain), hash_value(&json!({"id": 1, "title": "b"})));
    }

    #[test]
    fn test_hashing_is_idempotent() {
        let task = Task::new(TaskId::Confirmed(5), "Write report");
        let value = task.to_value();
        let once = canonicalize(&value);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
        assert_eq!(hash_value(&twice), hash_entity(&task));
    }

    #[test]
    fn test_known_digest() {
        // sha256("{}")
        assert_eq!(
            hash_value(&json!({})).as_str(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_collection_hash_is_order_independent() {
        let a = Task::new(TaskId::Confirmed(1), "a");
        let b = Task::new(TaskId::Confirmed(2), "b");
        let c = Task::new(TaskId::Provisional("temp_c".into()), "c");

        let forward = hash_collection(&[a.clone(), b.clone(), c.clone()]);
        let backward = hash_collection(&[c, b, a]);
        assert_eq!(forward, backward);
        assert!(forward.is_valid());
    }

    #[test]
    fn test_collection_hash_detects_change() {
        let a = Task::new(TaskId::Confirmed(1), "a");
        let mut a2 = a.clone();
        a2.title = "changed".into();
        assert_ne!(hash_collection(&[a]), hash_collection(&[a2]));
    }

    #[test]
    fn test_unhashable_entity_yields_sentinel() {
        let mut bad: HashMap<(i32, i32), i32> = HashMap::new();
        bad.insert((1, 2), 3);
        let checksum = hash_entity(&bad);
        assert_eq!(checksum, Checksum::invalid());
        assert!(!checksum.matches(&Checksum::invalid()));
        assert_eq!(hash_collection(&[bad]), Checksum::invalid());
    }

    #[test]
    fn test_sanitize_for_remote() {
        let clean = sanitize_for_remote(json!({"id": 1, "title": "a", "checksum": "x", "retry_count": 2}));
        assert_eq!(clean, json!({"id": 1, "title": "a"}));
    }
}
