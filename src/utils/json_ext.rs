//! JSON helpers for context assembly and routing lookups.

use serde_json::{Map, Value};

/// Walk a dot-separated path (`a.b.c`) through nested objects.
///
/// Used by the decision node's legacy `route_field_path` lookup.
///
/// ```rust
/// use llmctl_engine::utils::json_ext::get_dot_path;
/// use serde_json::json;
///
/// let value = json!({"a": {"b": {"c": "route-1"}}});
/// assert_eq!(get_dot_path(&value, "a.b.c"), Some(&json!("route-1")));
/// assert_eq!(get_dot_path(&value, "a.missing"), None);
/// ```
#[must_use]
pub fn get_dot_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Coerce a value into an owned JSON object map.
///
/// Null becomes an empty map; scalars are wrapped under `"value"` so callers
/// never lose data at a contract boundary.
#[must_use]
pub fn ensure_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dot_path_traverses_nested_objects() {
        let value = json!({"latest_upstream": {"output_state": {"route_key": "approve"}}});
        assert_eq!(
            get_dot_path(&value, "latest_upstream.output_state.route_key"),
            Some(&json!("approve"))
        );
    }

    #[test]
    fn scalars_wrap_under_value_when_coerced_to_objects() {
        let map = ensure_object(json!("plain"));
        assert_eq!(map.get("value"), Some(&json!("plain")));
        assert!(ensure_object(serde_json::Value::Null).is_empty());
    }
}
