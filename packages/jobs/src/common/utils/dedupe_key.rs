use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Length of a derived dedupe key, in hex characters.
pub const DEDUPE_KEY_LEN: usize = 32;

/// Derive a deterministic dedupe key for a job request.
///
/// Uses SHA256 of `"{job_type}:{canonical params}"` where object keys are
/// sorted at every depth, so logically identical requests collide no matter
/// how the caller ordered their fields.
pub fn derive_dedupe_key(job_type: &str, params: &Value) -> String {
    let canonical = canonicalize(params);

    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical.to_string().as_bytes());

    let mut key = hex::encode(hasher.finalize());
    key.truncate(DEDUPE_KEY_LEN);
    key
}

/// Rebuild a JSON value with object keys in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_same_params_same_key() {
        let a = derive_dedupe_key("echo", &json!({"n": 1}));
        let b = derive_dedupe_key("echo", &json!({"n": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), DEDUPE_KEY_LEN);
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"y": 2, "x": 1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"x": 1, "y": 2}, "a": 1}"#).unwrap();
        assert_eq!(derive_dedupe_key("sync", &a), derive_dedupe_key("sync", &b));
    }

    #[test]
    fn test_job_type_changes_key() {
        let params = json!({"item_id": "abc"});
        assert_ne!(
            derive_dedupe_key("compute_item_embedding", &params),
            derive_dedupe_key("maintenance_cleanup", &params)
        );
    }

    #[test]
    fn test_param_values_change_key() {
        assert_ne!(
            derive_dedupe_key("echo", &json!({"n": 1})),
            derive_dedupe_key("echo", &json!({"n": 2}))
        );
    }

    #[test]
    fn test_array_order_is_significant() {
        assert_ne!(
            derive_dedupe_key("tag", &json!({"tags": ["a", "b"]})),
            derive_dedupe_key("tag", &json!({"tags": ["b", "a"]}))
        );
    }
}
