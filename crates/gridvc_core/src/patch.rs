//! Structural patch engine.
//!
//! [`diff`] computes the minimal structural delta between two document
//! states; [`apply`] re-applies a delta to a base state. Patches are a
//! recursive partial-merge tree: objects merge key by key, everything else
//! replaces wholesale, and key deletion is an explicit tombstone.
//!
//! Determinism matters here: the same inputs must produce a byte-identical
//! serialized patch, so merge entries live in a `BTreeMap` and serde_json's
//! ordered object representation does the rest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{DocState, cap_string, sanitize};

/// A structural delta between two document states.
///
/// `apply(base, diff(base, target)) == target` for all normalized states,
/// and `diff(x, x)` is the empty patch. Patches compose left-to-right along
/// a commit's parent chain: replaying a chain of patches is equivalent to
/// applying their composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Patch {
    /// Replace the target value wholesale.
    Set(Value),
    /// Merge into an object key by key; absent keys are left untouched.
    Merge(BTreeMap<String, Patch>),
    /// Delete the key this patch is attached to (tombstone).
    Unset,
}

impl Patch {
    /// The empty patch: applying it leaves any state unchanged.
    pub fn empty() -> Self {
        Patch::Merge(BTreeMap::new())
    }

    /// Whether applying this patch is a no-op.
    pub fn is_empty(&self) -> bool {
        matches!(self, Patch::Merge(entries) if entries.is_empty())
    }
}

/// Compute the structural delta that transforms `base` into `target`.
pub fn diff(base: &DocState, target: &DocState) -> Patch {
    if base == target {
        return Patch::empty();
    }
    match (base, target) {
        (Value::Object(base_map), Value::Object(target_map)) => {
            let mut entries = BTreeMap::new();
            for (key, target_value) in target_map {
                match base_map.get(key) {
                    None => {
                        entries.insert(key.clone(), Patch::Set(target_value.clone()));
                    }
                    Some(base_value) if base_value == target_value => {}
                    Some(base_value) => {
                        entries.insert(key.clone(), diff(base_value, target_value));
                    }
                }
            }
            for key in base_map.keys() {
                if !target_map.contains_key(key) {
                    entries.insert(key.clone(), Patch::Unset);
                }
            }
            Patch::Merge(entries)
        }
        // Arrays and scalars replace wholesale.
        _ => Patch::Set(target.clone()),
    }
}

/// Apply a patch to a base state, producing the next state.
///
/// Total for well-formed and malformed patches alike: merging into a
/// non-object base starts from an empty object, and a stray tombstone at the
/// root yields the empty state.
pub fn apply(base: &DocState, patch: &Patch) -> DocState {
    match patch {
        Patch::Set(value) => value.clone(),
        Patch::Unset => Value::Null,
        Patch::Merge(entries) => {
            if entries.is_empty() {
                return base.clone();
            }
            let mut object = match base {
                Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            for (key, entry) in entries {
                match entry {
                    Patch::Unset => {
                        object.remove(key);
                    }
                    _ => {
                        let current = object.get(key).cloned().unwrap_or(Value::Null);
                        object.insert(key.clone(), apply(&current, entry));
                    }
                }
            }
            Value::Object(object)
        }
    }
}

/// Bound a patch read from a multi-writer backend (see [`sanitize`]).
pub fn sanitize_patch(patch: &Patch) -> Patch {
    match patch {
        Patch::Set(value) => Patch::Set(sanitize(value)),
        Patch::Unset => Patch::Unset,
        Patch::Merge(entries) => Patch::Merge(
            entries
                .iter()
                .map(|(k, p)| (cap_string(k), sanitize_patch(p)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::normalize;
    use serde_json::json;

    #[test]
    fn test_diff_identical_states_is_empty() {
        let s = json!({"sheets": {"Sheet1": {"A1": 1}}});
        assert!(diff(&s, &s).is_empty());
        assert_eq!(apply(&s, &diff(&s, &s)), s);
    }

    #[test]
    fn test_empty_patch_is_identity_for_scalars() {
        // An empty merge must not coerce a non-object state into an object.
        let s = json!(42);
        assert_eq!(apply(&s, &Patch::empty()), s);
    }

    #[test]
    fn test_round_trip_object_edit() {
        let base = json!({"sheets": {"Sheet1": {"A1": 1, "A2": 2}}, "title": "Budget"});
        let target = json!({"sheets": {"Sheet1": {"A1": 1, "A2": 5, "B1": "x"}}, "title": "Budget"});
        let patch = diff(&base, &target);
        assert_eq!(apply(&base, &patch), target);
    }

    #[test]
    fn test_round_trip_key_deletion() {
        let base = normalize(&json!({"sheets": {"Sheet1": {"A1": 1}}, "meta": {"owner": "a"}}));
        let target = normalize(&json!({"sheets": {"Sheet1": {}}}));
        let patch = diff(&base, &target);
        assert_eq!(apply(&base, &patch), target);
    }

    #[test]
    fn test_round_trip_type_change() {
        let base = json!({"cell": {"formula": "=A1"}});
        let target = json!({"cell": "plain"});
        assert_eq!(apply(&base, &diff(&base, &target)), target);
    }

    #[test]
    fn test_arrays_replace_wholesale() {
        let base = json!({"rows": [1, 2, 3]});
        let target = json!({"rows": [1, 2, 3, 4]});
        let patch = diff(&base, &target);
        assert_eq!(patch, Patch::Merge(std::collections::BTreeMap::from([(
            "rows".to_string(),
            Patch::Set(json!([1, 2, 3, 4])),
        )])));
        assert_eq!(apply(&base, &patch), target);
    }

    #[test]
    fn test_round_trip_from_empty_state() {
        let initial = json!({"sheets": {}, "title": "New"});
        let patch = diff(&Value::Null, &initial);
        assert_eq!(apply(&Value::Null, &patch), initial);
    }

    #[test]
    fn test_chain_replay_equals_direct_diff() {
        let s0 = json!({"a": 1});
        let s1 = json!({"a": 1, "b": {"c": 2}});
        let s2 = json!({"b": {"c": 3}});
        let p1 = diff(&s0, &s1);
        let p2 = diff(&s1, &s2);
        assert_eq!(apply(&apply(&s0, &p1), &p2), s2);
    }

    #[test]
    fn test_deterministic_serialization() {
        let base = json!({"z": 1, "a": 2, "m": {"y": 3, "b": 4}});
        let target = json!({"z": 9, "a": 2, "m": {"b": 5}, "q": true});
        let bytes_a = serde_json::to_vec(&diff(&base, &target)).unwrap();
        let bytes_b = serde_json::to_vec(&diff(&base, &target)).unwrap();
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_apply_total_for_foreign_patches() {
        // Merge aimed at a scalar, tombstone at the root: no panics.
        let merge = Patch::Merge(std::collections::BTreeMap::from([(
            "k".to_string(),
            Patch::Set(json!(1)),
        )]));
        assert_eq!(apply(&json!("scalar"), &merge), json!({"k": 1}));
        assert_eq!(apply(&json!({"a": 1}), &Patch::Unset), Value::Null);
    }

    #[test]
    fn test_patch_serde_round_trip() {
        let base = json!({"a": {"b": 1}, "gone": true});
        let target = json!({"a": {"b": 2}});
        let patch = diff(&base, &target);
        let json = serde_json::to_string(&patch).unwrap();
        let back: Patch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, patch);
    }
}
