//! Strict-mode JSON-Schema transform (spec §4.5.6), plus the independently
//! exposed `strip_extensions` / `apply_llm_descriptions` helpers.

use serde_json::{Map, Value};

const RECURSE_KEYS: &[&str] = &["properties", "items", "oneOf", "anyOf", "allOf", "definitions", "$defs"];

/// Deep-copies `schema` and recursively rewrites every object node: sets
/// `additionalProperties: false`, promotes every property to `required`
/// (sorted), and rewrites formerly-optional properties as nullable.
///
/// Idempotent: `to_strict(to_strict(x))` is structurally equal to
/// `to_strict(x)` (spec §8 property 7) — re-running the transform sees
/// every property already required and already nullable, so it is a no-op
/// on a second pass.
#[must_use]
pub fn to_strict(schema: &Value) -> Value {
    transform(schema)
}

fn transform(node: &Value) -> Value {
    match node {
        Value::Object(obj) => transform_object(obj),
        Value::Array(items) => Value::Array(items.iter().map(transform).collect()),
        other => other.clone(),
    }
}

fn transform_object(obj: &Map<String, Value>) -> Value {
    let mut out = Map::with_capacity(obj.len());
    for (key, value) in obj {
        if RECURSE_KEYS.contains(&key.as_str()) {
            out.insert(key.clone(), transform(value));
        } else {
            out.insert(key.clone(), value.clone());
        }
    }

    if let Some(Value::Object(props)) = out.get("properties").cloned() {
        let already_required: Vec<String> = out
            .get("required")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        let mut required: Vec<String> = props.keys().cloned().collect();
        required.sort();

        let mut new_props = Map::with_capacity(props.len());
        for (name, prop_schema) in &props {
            let was_required = already_required.contains(name);
            let final_schema = if was_required {
                prop_schema.clone()
            } else {
                make_nullable(prop_schema)
            };
            new_props.insert(name.clone(), final_schema);
        }

        out.insert("properties".to_owned(), Value::Object(new_props));
        out.insert(
            "required".to_owned(),
            Value::Array(required.into_iter().map(Value::String).collect()),
        );
        out.insert("additionalProperties".to_owned(), Value::Bool(false));
    }

    Value::Object(out)
}

/// Wraps `schema` so it also accepts `null`, without double-adding `null`
/// if it already does.
fn make_nullable(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return Value::Object(Map::from_iter([(
            "oneOf".to_owned(),
            Value::Array(vec![schema.clone(), Value::Object(Map::from_iter([(
                "type".to_owned(),
                Value::String("null".to_owned()),
            )]))]),
        )]));
    };

    match obj.get("type") {
        Some(Value::String(t)) => {
            if t == "null" {
                return schema.clone();
            }
            let mut out = obj.clone();
            out.insert(
                "type".to_owned(),
                Value::Array(vec![Value::String(t.clone()), Value::String("null".to_owned())]),
            );
            Value::Object(out)
        }
        Some(Value::Array(types)) => {
            if types.iter().any(|v| v.as_str() == Some("null")) {
                return schema.clone();
            }
            let mut new_types = types.clone();
            new_types.push(Value::String("null".to_owned()));
            let mut out = obj.clone();
            out.insert("type".to_owned(), Value::Array(new_types));
            Value::Object(out)
        }
        _ => {
            if let Some(one_of) = obj.get("oneOf").and_then(Value::as_array) {
                if one_of.iter().any(|v| v.get("type").and_then(Value::as_str) == Some("null")) {
                    return schema.clone();
                }
            }
            Value::Object(Map::from_iter([(
                "oneOf".to_owned(),
                Value::Array(vec![schema.clone(), Value::Object(Map::from_iter([(
                    "type".to_owned(),
                    Value::String("null".to_owned()),
                )]))]),
            )]))
        }
    }
}

/// Removes all keys starting with `x-` plus `default`, recursively.
#[must_use]
pub fn strip_extensions(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (key, value) in obj {
                if key.starts_with("x-") || key == "default" {
                    continue;
                }
                out.insert(key.clone(), strip_extensions(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_extensions).collect()),
        other => other.clone(),
    }
}

/// If `x-llm-description` is present on the top-level node, uses it as
/// `description`.
#[must_use]
pub fn apply_llm_descriptions(schema: &Value) -> Value {
    let Value::Object(obj) = schema else {
        return schema.clone();
    };
    let mut out = obj.clone();
    if let Some(llm_desc) = out.remove("x-llm-description") {
        out.insert("description".to_owned(), llm_desc);
    }
    Value::Object(out)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn promotes_optional_properties_to_required_and_nullable() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}, "b": {"type": "integer"}},
            "required": ["a"]
        });
        let strict = to_strict(&schema);
        assert_eq!(strict["additionalProperties"], json!(false));
        assert_eq!(strict["required"], json!(["a", "b"]));
        assert_eq!(strict["properties"]["a"], json!({"type": "string"}));
        assert_eq!(strict["properties"]["b"]["type"], json!(["integer", "null"]));
    }

    #[test]
    fn idempotent_on_second_pass() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "required": []
        });
        let once = to_strict(&schema);
        let twice = to_strict(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn nullable_does_not_double_add_null() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": ["string", "null"]}},
            "required": []
        });
        let strict = to_strict(&schema);
        assert_eq!(strict["properties"]["a"]["type"], json!(["string", "null"]));
    }

    #[test]
    fn strip_extensions_removes_x_prefixed_keys_and_default() {
        let schema = json!({"type": "string", "x-llm-description": "foo", "default": "bar"});
        let stripped = strip_extensions(&schema);
        assert!(stripped.get("x-llm-description").is_none());
        assert!(stripped.get("default").is_none());
        assert_eq!(stripped["type"], "string");
    }

    #[test]
    fn apply_llm_descriptions_overrides_description() {
        let schema = json!({"description": "orig", "x-llm-description": "better"});
        let out = apply_llm_descriptions(&schema);
        assert_eq!(out["description"], "better");
    }

    #[test]
    fn recurses_into_nested_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "child": {
                    "type": "object",
                    "properties": {"x": {"type": "string"}},
                    "required": []
                }
            },
            "required": ["child"]
        });
        let strict = to_strict(&schema);
        assert_eq!(strict["properties"]["child"]["additionalProperties"], json!(false));
    }
}
