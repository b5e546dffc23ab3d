//! Query keys and deterministic hashing.
//!
//! A query key is an arbitrary JSON tree (by convention an array) that names
//! a cache entry. Two keys with the same hash are the same entry. The default
//! hash is the canonical JSON encoding of the key; `serde_json` keeps object
//! keys sorted, so semantically equal keys always encode identically
//! regardless of construction order.

use std::sync::Arc;

use serde_json::Value;

/// Logical identity of a cache entry.
pub type QueryKey = Value;

/// User-overridable hash function for query keys.
pub type QueryKeyHashFn = Arc<dyn Fn(&QueryKey) -> String + Send + Sync>;

/// Hashes a key into its canonical string form.
#[must_use]
pub fn hash_query_key(key: &QueryKey) -> String {
    serde_json::to_string(key).unwrap_or_default()
}

/// Hashes a key with the configured hash function, falling back to
/// [`hash_query_key`].
#[must_use]
pub fn hash_query_key_with(key: &QueryKey, hash_fn: Option<&QueryKeyHashFn>) -> String {
    match hash_fn {
        Some(hash_fn) => hash_fn(key),
        None => hash_query_key(key),
    }
}

/// Checks whether `key` matches the partial `filter` key.
///
/// Objects match when every property of the filter matches the corresponding
/// property of the key; arrays match by prefix. Scalars must be equal. An
/// empty filter array therefore matches every array key.
#[must_use]
pub fn partial_match_key(key: &QueryKey, filter: &QueryKey) -> bool {
    if key == filter {
        return true;
    }

    match (key, filter) {
        (Value::Object(key), Value::Object(filter)) => filter
            .iter()
            .all(|(name, value)| key.get(name).is_some_and(|k| partial_match_key(k, value))),
        (Value::Array(key), Value::Array(filter)) => {
            filter.len() <= key.len()
                && filter
                    .iter()
                    .zip(key.iter())
                    .all(|(f, k)| partial_match_key(k, f))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_deterministic() {
        let a = json!({ "b": 1, "a": 2 });
        let b = json!({ "a": 2, "b": 1 });
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn test_hash_nested_objects_sorted() {
        let a = json!(["todos", { "filters": { "done": true, "archived": false } }]);
        let b = json!(["todos", { "filters": { "archived": false, "done": true } }]);
        assert_eq!(hash_query_key(&a), hash_query_key(&b));
    }

    #[test]
    fn test_empty_keys_do_not_collide() {
        let empty_string = json!("");
        let empty_object = json!({});
        let empty_array = json!([]);

        let hashes = [
            hash_query_key(&empty_string),
            hash_query_key(&empty_object),
            hash_query_key(&empty_array),
        ];
        assert_eq!(hashes[0], "\"\"");
        assert_eq!(hashes[1], "{}");
        assert_eq!(hashes[2], "[]");
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[1], hashes[2]);
    }

    #[test]
    fn test_custom_hash_fn() {
        let hash_fn: QueryKeyHashFn = Arc::new(|_| "constant".to_string());
        assert_eq!(
            hash_query_key_with(&json!(["todos"]), Some(&hash_fn)),
            "constant"
        );
        assert_eq!(hash_query_key_with(&json!(["todos"]), None), "[\"todos\"]");
    }

    #[test]
    fn test_partial_match_array_prefix() {
        let key = json!(["todos", 1, { "done": true }]);
        assert!(partial_match_key(&key, &json!(["todos"])));
        assert!(partial_match_key(&key, &json!(["todos", 1])));
        assert!(partial_match_key(&key, &json!([])));
        assert!(!partial_match_key(&key, &json!(["users"])));
        assert!(!partial_match_key(&key, &json!(["todos", 2])));
    }

    #[test]
    fn test_partial_match_object_subset() {
        let key = json!(["todos", { "page": 1, "done": true }]);
        assert!(partial_match_key(&key, &json!(["todos", { "page": 1 }])));
        assert!(!partial_match_key(&key, &json!(["todos", { "page": 2 }])));
    }

    #[test]
    fn test_partial_match_longer_filter_fails() {
        let key = json!(["todos"]);
        assert!(!partial_match_key(&key, &json!(["todos", 1])));
    }

    #[test]
    fn test_exact_scalar_match() {
        assert!(partial_match_key(&json!("a"), &json!("a")));
        assert!(!partial_match_key(&json!("a"), &json!("b")));
    }
}
