//! Structured merge of a configuration patch into a live object.

use serde_json::{Map, Value};

/// Server-populated metadata that must not be re-applied.
const SERVER_FIELDS: [&str; 5] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "generation",
];

const LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Merge `patch` into `base` in place.
///
/// - objects merge key by key, recursively
/// - two arrays of scalars are unioned: `base` order first, then new
///   entries from `patch`, without duplicates
/// - anything else in `patch` replaces the value in `base`
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => merge_objects(base, patch),
        (Value::Array(base), Value::Array(patch))
            if all_scalars(base.as_slice()) && all_scalars(patch) =>
        {
            for item in patch {
                if !base.contains(item) {
                    base.push(item.clone());
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn merge_objects(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match base.get_mut(key) {
            Some(existing) => merge_json(existing, value),
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn all_scalars(items: &[Value]) -> bool {
    items
        .iter()
        .all(|v| !matches!(v, Value::Array(_) | Value::Object(_)))
}

/// Drop fields the API server owns so the object can be applied again.
pub fn strip_server_fields(object: &mut Value) {
    let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    for field in SERVER_FIELDS {
        metadata.remove(field);
    }
    if let Some(annotations) = metadata
        .get_mut("annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.remove(LAST_APPLIED);
        if annotations.is_empty() {
            metadata.remove("annotations");
        }
    }
    if let Some(obj) = object.as_object_mut() {
        obj.remove("status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redirect_uris_are_unioned() {
        let mut live = json!({
            "spec": {"redirectURIs": ["https://a/cb", "https://b/cb"], "public": false}
        });
        let patch = json!({
            "spec": {"redirectURIs": ["https://b/cb", "https://c/cb"]}
        });
        merge_json(&mut live, &patch);
        assert_eq!(
            live["spec"]["redirectURIs"],
            json!(["https://a/cb", "https://b/cb", "https://c/cb"])
        );
        assert_eq!(live["spec"]["public"], json!(false));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut live = json!({"data": {"uris": ["x"]}});
        let patch = json!({"data": {"uris": ["x", "y"], "mode": "strict"}});
        merge_json(&mut live, &patch);
        let once = live.clone();
        merge_json(&mut live, &patch);
        assert_eq!(live, once);
    }

    #[test]
    fn test_object_arrays_are_replaced() {
        let mut live = json!({"ports": [{"port": 80}]});
        merge_json(&mut live, &json!({"ports": [{"port": 443}]}));
        assert_eq!(live, json!({"ports": [{"port": 443}]}));
    }

    #[test]
    fn test_scalars_replace() {
        let mut live = json!({"replicas": 1, "labels": {"a": "1"}});
        merge_json(&mut live, &json!({"replicas": 3, "labels": {"b": "2"}}));
        assert_eq!(live, json!({"replicas": 3, "labels": {"a": "1", "b": "2"}}));
    }

    #[test]
    fn test_strip_server_fields() {
        let mut live = json!({
            "metadata": {
                "name": "identity",
                "uid": "123",
                "resourceVersion": "9",
                "generation": 4,
                "annotations": {"kubectl.kubernetes.io/last-applied-configuration": "{}"},
                "labels": {"app": "identity"}
            },
            "status": {"ready": true},
            "spec": {}
        });
        strip_server_fields(&mut live);
        assert_eq!(
            live,
            json!({
                "metadata": {"name": "identity", "labels": {"app": "identity"}},
                "spec": {}
            })
        );
    }
}
