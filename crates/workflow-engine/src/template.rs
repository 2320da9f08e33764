//! `{{key}}` substitution against shared state.
//!
//! Intentionally limited to dotted key lookups: no expressions, no
//! arbitrary evaluation. Unresolvable keys leave the placeholder in place
//! so a bad reference is diagnosable in the final state.

use common::types::{JsonMap, JsonValue};

/// Walk a value, replacing `{{key}}` occurrences in strings with the
/// stringified state value at that (dotted) key. Objects and arrays are
/// walked recursively; other types pass through unchanged.
pub fn resolve_templates(value: &JsonValue, state: &JsonMap) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(resolve_string(s, state)),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_templates(v, state)))
                .collect(),
        ),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| resolve_templates(v, state)).collect())
        }
        other => other.clone(),
    }
}

fn resolve_string(input: &str, state: &JsonMap) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            break;
        };
        let key = rest[open + 2..open + 2 + close].trim();
        out.push_str(&rest[..open]);

        match lookup_path(state, key) {
            Some(value) => out.push_str(&value_to_string(value)),
            // Unknown key: keep the placeholder verbatim.
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &rest[open + 2 + close + 2..];
    }
    out.push_str(rest);
    out
}

/// Resolve a dotted key (`user.name`) against nested state objects.
fn lookup_path<'a>(state: &'a JsonMap, dotted: &str) -> Option<&'a JsonValue> {
    if dotted.is_empty() {
        return None;
    }
    let mut segments = dotted.split('.');
    let first = segments.next()?;
    let mut current = state.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: JsonValue) -> JsonMap {
        match value {
            JsonValue::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn substitutes_simple_keys() {
        let state = state(json!({"baseUrl": "https://x", "apiKey": "k"}));
        assert_eq!(
            resolve_templates(&json!("{{baseUrl}}/v1"), &state),
            json!("https://x/v1")
        );
        assert_eq!(
            resolve_templates(&json!("Bearer {{apiKey}}"), &state),
            json!("Bearer k")
        );
    }

    #[test]
    fn substitutes_dotted_keys() {
        let state = state(json!({"user": {"name": "Narcis"}}));
        assert_eq!(
            resolve_templates(&json!("hello {{user.name}}"), &state),
            json!("hello Narcis")
        );
    }

    #[test]
    fn non_string_values_are_stringified() {
        let state = state(json!({"retries": 3, "enabled": true}));
        assert_eq!(
            resolve_templates(&json!("{{retries}} tries, on={{enabled}}"), &state),
            json!("3 tries, on=true")
        );
    }

    #[test]
    fn unknown_keys_leave_the_placeholder() {
        let state = state(json!({}));
        assert_eq!(
            resolve_templates(&json!("{{missing}} stays"), &state),
            json!("{{missing}} stays")
        );
    }

    #[test]
    fn walks_objects_and_arrays() {
        let state = state(json!({"host": "example.org"}));
        let value = json!({
            "url": "https://{{host}}/api",
            "mirrors": ["{{host}}", {"deep": "{{host}}"}],
            "count": 2
        });
        assert_eq!(
            resolve_templates(&value, &state),
            json!({
                "url": "https://example.org/api",
                "mirrors": ["example.org", {"deep": "example.org"}],
                "count": 2
            })
        );
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        let state = state(json!({"a": 1}));
        assert_eq!(
            resolve_templates(&json!("broken {{a"), &state),
            json!("broken {{a")
        );
    }
}
