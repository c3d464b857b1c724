//! `{{ path.to.value }}` template interpolation against a JSON context.
//!
//! Tokens resolve through dot-separated paths into the context object. A
//! missing or null value interpolates to the empty string; non-string
//! leaves are stringified (scalars raw, composites as compact JSON).

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid token regex"))
}

/// Resolve a dot-separated path through nested objects.
fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Replace every template token in `template` with its context value.
pub fn interpolate(template: &str, context: &Value) -> String {
    token_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup(context, &caps[1]).map(stringify).unwrap_or_default()
        })
        .into_owned()
}

/// Interpolate every string leaf of a JSON value, recursively.
pub fn interpolate_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate(s, context)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "node": {
                "id": "n-1",
                "content": "ship it",
                "meta": { "count": 3, "starred": true }
            },
            "automation_name": "notify",
            "empty": null
        })
    }

    #[test]
    fn test_simple_token() {
        assert_eq!(
            interpolate("run {{ automation_name }}", &context()),
            "run notify"
        );
    }

    #[test]
    fn test_nested_path() {
        assert_eq!(
            interpolate("{{node.content}} ({{ node.meta.count }})", &context()),
            "ship it (3)"
        );
    }

    #[test]
    fn test_missing_and_null_paths_become_empty() {
        assert_eq!(interpolate("[{{ nope.nothing }}]", &context()), "[]");
        assert_eq!(interpolate("[{{ empty }}]", &context()), "[]");
    }

    #[test]
    fn test_non_string_leaves_are_stringified() {
        assert_eq!(interpolate("{{ node.meta.starred }}", &context()), "true");
        assert_eq!(
            interpolate("{{ node.meta }}", &context()),
            r#"{"count":3,"starred":true}"#
        );
    }

    #[test]
    fn test_path_through_non_object_is_missing() {
        assert_eq!(interpolate("[{{ node.content.deeper }}]", &context()), "[]");
    }

    #[test]
    fn test_interpolate_value_recurses() {
        let body = json!({
            "title": "{{ node.content }}",
            "tags": ["{{ automation_name }}", "fixed"],
            "count": 3
        });
        let out = interpolate_value(&body, &context());
        assert_eq!(
            out,
            json!({
                "title": "ship it",
                "tags": ["notify", "fixed"],
                "count": 3
            })
        );
    }

    #[test]
    fn test_untokenized_text_is_untouched() {
        assert_eq!(interpolate("no tokens here", &context()), "no tokens here");
    }
}
