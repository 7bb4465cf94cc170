//! Document state representation.
//!
//! A document state is the versioned payload (sheets, cells, metadata)
//! treated as an opaque, deeply-comparable JSON value tree. States are never
//! mutated in place; every transition produces a new value.

use serde_json::Value;

/// A full document state: an opaque nested JSON value tree.
pub type DocState = Value;

/// Maximum length (in characters) a leaf string survives sanitization with.
const MAX_LEAF_STRING_LEN: usize = 4096;

/// Maximum nesting depth sanitization preserves; deeper values become null.
const MAX_VALUE_DEPTH: usize = 64;

/// The canonical empty document state, the implicit parent of a root commit.
pub fn empty_state() -> DocState {
    Value::Null
}

/// Normalize a state to its canonical shape for diffing and storage.
///
/// Object entries whose value is `null` are dropped recursively, so "absent"
/// and "explicitly null" are one and the same state. This is what makes
/// tombstoned deletions round-trip exactly: `apply(base, diff(base, target))`
/// compares equal to `target` by plain value equality.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Bound a value read from a multi-writer backend.
///
/// A peer-written payload may be malformed or adversarial; before it is
/// handed to a caller, leaf strings are trimmed and length-capped and
/// pathological nesting is cut off. Sanitization never fails: anything it
/// cannot keep is replaced with `null`.
pub fn sanitize(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, depth: usize) -> Value {
    if depth >= MAX_VALUE_DEPTH {
        return Value::Null;
    }
    match value {
        Value::String(s) => Value::String(cap_string(s)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (cap_string(k), sanitize_at(v, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| sanitize_at(v, depth + 1)).collect())
        }
        other => other.clone(),
    }
}

pub(crate) fn cap_string(s: &str) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(MAX_LEAF_STRING_LEN) {
        Some((byte_idx, _)) => trimmed[..byte_idx].to_string(),
        None => trimmed.to_string(),
    }
}
