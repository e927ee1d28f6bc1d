//! JSON merge patches (RFC 7386).
//!
//! Finalizer and label changes are sent as merge patches computed against
//! the snapshot taken right after fetch.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::store::StoreError;

/// Compute the merge patch that turns `original` into `modified`.
///
/// Removed keys become `null`; arrays and scalars are replaced wholesale.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => {
            let mut patch = Map::new();

            for (key, orig_value) in orig {
                match modi.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(mod_value) if mod_value != orig_value => {
                        let child = if orig_value.is_object() && mod_value.is_object() {
                            create_merge_patch(orig_value, mod_value)
                        } else {
                            mod_value.clone()
                        };
                        patch.insert(key.clone(), child);
                    }
                    Some(_) => {}
                }
            }

            for (key, mod_value) in modi {
                if !orig.contains_key(key) {
                    patch.insert(key.clone(), mod_value.clone());
                }
            }

            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Apply a merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let entry = target_map.entry(key.clone()).or_insert(Value::Null);
                apply_merge_patch(entry, value);
            }
        }
    }
}

/// Serialize both objects and compute their merge patch.
pub fn merge_patch_between<T: Serialize>(original: &T, modified: &T) -> Result<Value, StoreError> {
    let original = serde_json::to_value(original)?;
    let modified = serde_json::to_value(modified)?;
    Ok(create_merge_patch(&original, &modified))
}

/// Returns true if the patch carries no changes.
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(Map::is_empty)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_patch_only_changed_fields() {
        let original = json!({"metadata": {"name": "a", "finalizers": []}, "status": {"x": 1}});
        let modified = json!({"metadata": {"name": "a", "finalizers": ["f"]}, "status": {"x": 1}});

        let patch = create_merge_patch(&original, &modified);
        assert_eq!(patch, json!({"metadata": {"finalizers": ["f"]}}));
    }

    #[test]
    fn test_removed_keys_become_null() {
        let original = json!({"labels": {"a": "1", "b": "2"}});
        let modified = json!({"labels": {"a": "1"}});

        let patch = create_merge_patch(&original, &modified);
        assert_eq!(patch, json!({"labels": {"b": null}}));
    }

    #[test]
    fn test_apply_reverses_create() {
        let original = json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"});
        let modified = json!({"a": {"c": [3]}, "e": true});

        let patch = create_merge_patch(&original, &modified);
        let mut target = original.clone();
        apply_merge_patch(&mut target, &patch);

        assert_eq!(target, modified);
    }

    #[test]
    fn test_empty_patch() {
        let value = json!({"a": 1});
        let patch = create_merge_patch(&value, &value);
        assert!(is_empty_patch(&patch));
        assert!(!is_empty_patch(&json!({"a": 2})));
    }
}
