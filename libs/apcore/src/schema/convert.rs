//! JSON Schema → runtime schema conversion (spec §4.5.3).

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{NumberConstraints, RuntimeSchema, StringConstraints};

/// Recursively converts a JSON Schema document into a [`RuntimeSchema`].
/// Anything unrecognized falls through to `RuntimeSchema::Unknown`.
#[must_use]
pub fn json_schema_to_runtime(schema: &Value) -> RuntimeSchema {
    let Some(obj) = schema.as_object() else {
        return RuntimeSchema::Unknown;
    };

    if let Some(enum_values) = obj.get("enum").and_then(Value::as_array) {
        return RuntimeSchema::Enum(enum_values.clone());
    }
    if let Some(one_of) = obj.get("oneOf").and_then(Value::as_array) {
        return RuntimeSchema::Union(one_of.iter().map(json_schema_to_runtime).collect());
    }
    if let Some(any_of) = obj.get("anyOf").and_then(Value::as_array) {
        return RuntimeSchema::Union(any_of.iter().map(json_schema_to_runtime).collect());
    }
    if let Some(all_of) = obj.get("allOf").and_then(Value::as_array) {
        return RuntimeSchema::Intersection(all_of.iter().map(json_schema_to_runtime).collect());
    }

    let Some(ty) = obj.get("type").and_then(Value::as_str) else {
        return RuntimeSchema::Unknown;
    };

    match ty {
        "object" => convert_object(obj),
        "array" => convert_array(obj),
        "string" => RuntimeSchema::String(StringConstraints {
            min_length: obj.get("minLength").and_then(Value::as_u64),
            max_length: obj.get("maxLength").and_then(Value::as_u64),
            pattern: obj
                .get("pattern")
                .and_then(Value::as_str)
                .map(str::to_owned),
            format: obj
                .get("format")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }),
        "integer" => RuntimeSchema::Integer(number_constraints(obj)),
        "number" => RuntimeSchema::Number(number_constraints(obj)),
        "boolean" => RuntimeSchema::Boolean,
        "null" => RuntimeSchema::Null,
        _ => RuntimeSchema::Unknown,
    }
}

fn number_constraints(obj: &serde_json::Map<String, Value>) -> NumberConstraints {
    NumberConstraints {
        minimum: obj.get("minimum").and_then(Value::as_f64),
        maximum: obj.get("maximum").and_then(Value::as_f64),
        exclusive_minimum: obj.get("exclusiveMinimum").and_then(Value::as_f64),
        exclusive_maximum: obj.get("exclusiveMaximum").and_then(Value::as_f64),
        multiple_of: obj.get("multipleOf").and_then(Value::as_f64),
    }
}

fn convert_object(obj: &serde_json::Map<String, Value>) -> RuntimeSchema {
    let Some(props) = obj.get("properties").and_then(Value::as_object) else {
        return RuntimeSchema::ObjectAny;
    };
    let required: BTreeSet<String> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let properties: BTreeMap<String, RuntimeSchema> = props
        .iter()
        .map(|(k, v)| (k.clone(), json_schema_to_runtime(v)))
        .collect();
    RuntimeSchema::Object {
        properties,
        required,
    }
}

fn convert_array(obj: &serde_json::Map<String, Value>) -> RuntimeSchema {
    match obj.get("items") {
        Some(items) => RuntimeSchema::Array(Box::new(json_schema_to_runtime(items))),
        None => RuntimeSchema::ArrayAny,
    }
}
