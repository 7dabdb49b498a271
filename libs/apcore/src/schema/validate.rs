//! Input/output validation against a [`RuntimeSchema`] (spec §4.5.4).

use serde_json::{Map, Value};

use apcore_errors::ApcoreError;

use super::RuntimeSchema;

/// One structured validation failure.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Violation {
    pub path: String,
    pub message: String,
    pub constraint: String,
    pub expected: Value,
    pub actual: Value,
}

impl Violation {
    fn new(
        path: &str,
        message: impl Into<String>,
        constraint: &str,
        expected: Value,
        actual: &Value,
    ) -> Self {
        Self {
            path: path.to_owned(),
            message: message.into(),
            constraint: constraint.to_owned(),
            expected,
            actual: actual.clone(),
        }
    }
}

/// Whether the validator attempts type coercion before failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    #[default]
    Coercing,
    Strict,
}

/// Validates (and, in `Coercing` mode, repairs) a JSON value against a
/// [`RuntimeSchema`].
pub struct Validator {
    mode: ValidationMode,
}

impl Validator {
    #[must_use]
    pub fn new(mode: ValidationMode) -> Self {
        Self { mode }
    }

    /// Validates `value` as a module's input, returning the (possibly
    /// coerced) value or raising `SchemaValidationError`.
    ///
    /// # Errors
    /// Returns `ApcoreError::SchemaValidationError` carrying the list of
    /// [`Violation`]s when validation fails.
    pub fn validate_input(
        &self,
        module_id: &str,
        value: &Value,
        schema: &RuntimeSchema,
    ) -> Result<Value, ApcoreError> {
        self.validate(module_id, value, schema)
    }

    /// Validates `value` as a module's output. See [`Validator::validate_input`].
    ///
    /// # Errors
    /// Returns `ApcoreError::SchemaValidationError` carrying the list of
    /// [`Violation`]s when validation fails.
    pub fn validate_output(
        &self,
        module_id: &str,
        value: &Value,
        schema: &RuntimeSchema,
    ) -> Result<Value, ApcoreError> {
        self.validate(module_id, value, schema)
    }

    fn validate(
        &self,
        module_id: &str,
        value: &Value,
        schema: &RuntimeSchema,
    ) -> Result<Value, ApcoreError> {
        let mut violations = Vec::new();
        let result = check(value, schema, "", self.mode, &mut violations);
        if violations.is_empty() {
            Ok(result)
        } else {
            let details: Vec<Value> = violations
                .into_iter()
                .map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
                .collect();
            Err(ApcoreError::schema_validation_error(module_id, details))
        }
    }
}

#[expect(clippy::too_many_lines, reason = "dispatch over every schema variant")]
fn check(
    value: &Value,
    schema: &RuntimeSchema,
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
) -> Value {
    match schema {
        RuntimeSchema::ObjectAny | RuntimeSchema::Unknown => value.clone(),
        RuntimeSchema::ArrayAny => value.clone(),
        RuntimeSchema::Object {
            properties,
            required,
        } => check_object(value, properties, required, path, mode, violations),
        RuntimeSchema::Array(item_schema) => check_array(value, item_schema, path, mode, violations),
        RuntimeSchema::String(constraints) => check_string(value, constraints, path, mode, violations),
        RuntimeSchema::Integer(constraints) => {
            check_number(value, constraints, path, mode, violations, true)
        }
        RuntimeSchema::Number(constraints) => {
            check_number(value, constraints, path, mode, violations, false)
        }
        RuntimeSchema::Boolean => check_boolean(value, path, mode, violations),
        RuntimeSchema::Null => check_null(value, path, violations),
        RuntimeSchema::Enum(allowed) => check_enum(value, allowed, path, violations),
        RuntimeSchema::Union(variants) => check_union(value, variants, path, mode, violations),
        RuntimeSchema::Intersection(parts) => {
            let mut current = value.clone();
            for part in parts {
                current = check(&current, part, path, mode, violations);
            }
            current
        }
    }
}

fn check_object(
    value: &Value,
    properties: &std::collections::BTreeMap<String, RuntimeSchema>,
    required: &std::collections::BTreeSet<String>,
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
) -> Value {
    let Some(obj) = value.as_object() else {
        violations.push(Violation::new(
            path,
            "expected an object",
            "type",
            Value::String("object".into()),
            value,
        ));
        return value.clone();
    };

    let mut out = Map::with_capacity(obj.len());
    for key in required {
        if !obj.contains_key(key) {
            violations.push(Violation::new(
                &format!("{path}/{key}"),
                format!("missing required property '{key}'"),
                "required",
                Value::String(key.clone()),
                &Value::Null,
            ));
        }
    }
    for (key, val) in obj {
        let child_path = format!("{path}/{key}");
        if let Some(prop_schema) = properties.get(key) {
            out.insert(key.clone(), check(val, prop_schema, &child_path, mode, violations));
        } else {
            out.insert(key.clone(), val.clone());
        }
    }
    Value::Object(out)
}

fn check_array(
    value: &Value,
    item_schema: &RuntimeSchema,
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
) -> Value {
    let Some(items) = value.as_array() else {
        violations.push(Violation::new(
            path,
            "expected an array",
            "type",
            Value::String("array".into()),
            value,
        ));
        return value.clone();
    };
    let out: Vec<Value> = items
        .iter()
        .enumerate()
        .map(|(i, item)| check(item, item_schema, &format!("{path}/{i}"), mode, violations))
        .collect();
    Value::Array(out)
}

fn check_string(
    value: &Value,
    constraints: &super::StringConstraints,
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
) -> Value {
    let coerced = match (value, mode) {
        (Value::String(_), _) => value.clone(),
        (Value::Number(n), ValidationMode::Coercing) => Value::String(n.to_string()),
        (Value::Bool(b), ValidationMode::Coercing) => Value::String(b.to_string()),
        _ => {
            violations.push(Violation::new(
                path,
                "expected a string",
                "type",
                Value::String("string".into()),
                value,
            ));
            return value.clone();
        }
    };
    let Value::String(s) = &coerced else {
        return coerced;
    };
    if let Some(min) = constraints.min_length {
        if (s.chars().count() as u64) < min {
            violations.push(Violation::new(
                path,
                format!("string shorter than minLength {min}"),
                "minLength",
                Value::from(min),
                value,
            ));
        }
    }
    if let Some(max) = constraints.max_length {
        if (s.chars().count() as u64) > max {
            violations.push(Violation::new(
                path,
                format!("string longer than maxLength {max}"),
                "maxLength",
                Value::from(max),
                value,
            ));
        }
    }
    if let Some(pattern) = &constraints.pattern {
        match regex::Regex::new(pattern) {
            Ok(re) if !re.is_match(s) => violations.push(Violation::new(
                path,
                format!("string does not match pattern '{pattern}'"),
                "pattern",
                Value::String(pattern.clone()),
                value,
            )),
            _ => {}
        }
    }
    coerced
}

fn check_number(
    value: &Value,
    constraints: &super::NumberConstraints,
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
    integer: bool,
) -> Value {
    let coerced = match (value, mode) {
        (Value::Number(_), _) => value.clone(),
        (Value::String(s), ValidationMode::Coercing) => s
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    };
    let Some(num) = coerced.as_f64() else {
        violations.push(Violation::new(
            path,
            "expected a number",
            "type",
            Value::String(if integer { "integer".into() } else { "number".into() }),
            value,
        ));
        return value.clone();
    };
    if integer && num.fract() != 0.0 {
        violations.push(Violation::new(
            path,
            "expected an integer",
            "type",
            Value::String("integer".into()),
            value,
        ));
    }
    if let Some(min) = constraints.minimum {
        if num < min {
            violations.push(Violation::new(path, format!("value below minimum {min}"), "minimum", Value::from(min), value));
        }
    }
    if let Some(max) = constraints.maximum {
        if num > max {
            violations.push(Violation::new(path, format!("value above maximum {max}"), "maximum", Value::from(max), value));
        }
    }
    if let Some(min) = constraints.exclusive_minimum {
        if num <= min {
            violations.push(Violation::new(path, format!("value not above exclusiveMinimum {min}"), "exclusiveMinimum", Value::from(min), value));
        }
    }
    if let Some(max) = constraints.exclusive_maximum {
        if num >= max {
            violations.push(Violation::new(path, format!("value not below exclusiveMaximum {max}"), "exclusiveMaximum", Value::from(max), value));
        }
    }
    if let Some(multiple) = constraints.multiple_of {
        if multiple > 0.0 && (num / multiple).fract().abs() > f64::EPSILON {
            violations.push(Violation::new(path, format!("value is not a multiple of {multiple}"), "multipleOf", Value::from(multiple), value));
        }
    }
    coerced
}

fn check_boolean(value: &Value, path: &str, mode: ValidationMode, violations: &mut Vec<Violation>) -> Value {
    match (value, mode) {
        (Value::Bool(_), _) => value.clone(),
        (Value::String(s), ValidationMode::Coercing) if s == "true" || s == "false" => {
            Value::Bool(s == "true")
        }
        _ => {
            violations.push(Violation::new(
                path,
                "expected a boolean",
                "type",
                Value::String("boolean".into()),
                value,
            ));
            value.clone()
        }
    }
}

fn check_null(value: &Value, path: &str, violations: &mut Vec<Violation>) -> Value {
    if !value.is_null() {
        violations.push(Violation::new(
            path,
            "expected null",
            "type",
            Value::String("null".into()),
            value,
        ));
    }
    value.clone()
}

fn check_enum(value: &Value, allowed: &[Value], path: &str, violations: &mut Vec<Violation>) -> Value {
    if !allowed.contains(value) {
        violations.push(Violation::new(
            path,
            "value is not one of the allowed enum values",
            "enum",
            Value::Array(allowed.to_vec()),
            value,
        ));
    }
    value.clone()
}

fn check_union(
    value: &Value,
    variants: &[RuntimeSchema],
    path: &str,
    mode: ValidationMode,
    violations: &mut Vec<Violation>,
) -> Value {
    for variant in variants {
        let mut local = Vec::new();
        let result = check(value, variant, path, mode, &mut local);
        if local.is_empty() {
            return result;
        }
    }
    violations.push(Violation::new(
        path,
        "value does not match any union variant",
        "oneOf",
        Value::Null,
        value,
    ));
    value.clone()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::schema::json_schema_to_runtime;
    use serde_json::json;

    fn schema(v: Value) -> RuntimeSchema {
        json_schema_to_runtime(&v)
    }

    #[test]
    fn required_property_missing_is_violation() {
        let s = schema(json!({"type": "object", "properties": {"a": {"type": "integer"}}, "required": ["a"]}));
        let validator = Validator::new(ValidationMode::Strict);
        let err = validator.validate_input("m", &json!({}), &s).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_VALIDATION_ERROR");
    }

    #[test]
    fn coercing_mode_converts_number_to_string() {
        let s = schema(json!({"type": "string"}));
        let validator = Validator::new(ValidationMode::Coercing);
        let out = validator.validate_input("m", &json!(42), &s).unwrap();
        assert_eq!(out, json!("42"));
    }

    #[test]
    fn strict_mode_rejects_number_for_string() {
        let s = schema(json!({"type": "string"}));
        let validator = Validator::new(ValidationMode::Strict);
        assert!(validator.validate_input("m", &json!(42), &s).is_err());
    }

    #[test]
    fn numeric_bounds_are_enforced() {
        let s = schema(json!({"type": "integer", "minimum": 0, "maximum": 10}));
        let validator = Validator::new(ValidationMode::Strict);
        assert!(validator.validate_input("m", &json!(20), &s).is_err());
        assert!(validator.validate_input("m", &json!(5), &s).is_ok());
    }

    #[test]
    fn enum_rejects_value_outside_set() {
        let s = schema(json!({"enum": ["a", "b"]}));
        let validator = Validator::new(ValidationMode::Strict);
        assert!(validator.validate_input("m", &json!("c"), &s).is_err());
        assert!(validator.validate_input("m", &json!("a"), &s).is_ok());
    }

    #[test]
    fn union_accepts_any_matching_variant() {
        let s = schema(json!({"oneOf": [{"type": "string"}, {"type": "null"}]}));
        let validator = Validator::new(ValidationMode::Strict);
        assert!(validator.validate_input("m", &json!(null), &s).is_ok());
        assert!(validator.validate_input("m", &json!("x"), &s).is_ok());
        assert!(validator.validate_input("m", &json!(5), &s).is_err());
    }

    #[test]
    fn object_any_is_permissive() {
        let s = RuntimeSchema::ObjectAny;
        let validator = Validator::new(ValidationMode::Strict);
        assert!(validator.validate_input("m", &json!({"anything": 1}), &s).is_ok());
    }
}
