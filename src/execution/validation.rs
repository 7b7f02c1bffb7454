//! Argument validation against a tool's input schema.
//!
//! Checks, in order: required properties are present, every supplied property
//! is declared, each value matches its declared type, and enum-constrained
//! values are in their allowed set. All violations are collected.

use serde_json::{Map, Value};

use super::errors::ValidationError;
use crate::mcp_client::types::{PropertySchema, ToolInputSchema};

/// JSON type name of a runtime value, as used in schemas.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.as_f64().is_some_and(|n| n.fract() == 0.0),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unrecognised type names are not enforced.
        _ => true,
    }
}

/// Validate `arguments` against `schema`, returning every violation found.
pub fn validate_arguments(schema: &ToolInputSchema, arguments: &Value) -> Vec<ValidationError> {
    let empty = Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return vec![ValidationError::NotAnObject {
                actual: json_type_name(other).to_string(),
            }]
        }
    };

    let mut errors = Vec::new();

    for name in &schema.required {
        if !args.contains_key(name) {
            errors.push(ValidationError::MissingRequired { name: name.clone() });
        }
    }

    for (name, value) in args {
        match schema.properties.get(name) {
            Some(property) => check_property(name, property, value, &mut errors),
            None => errors.push(ValidationError::UnknownParameter { name: name.clone() }),
        }
    }

    errors
}

fn check_property(name: &str, property: &PropertySchema, value: &Value, errors: &mut Vec<ValidationError>) {
    let types = property.type_names();
    if !types.is_empty() && !types.iter().any(|t| matches_type(value, t)) {
        errors.push(ValidationError::TypeMismatch {
            name: name.to_string(),
            expected: types.join("|"),
            actual: json_type_name(value).to_string(),
        });
        return;
    }

    if let Some(allowed) = &property.enum_values {
        if !allowed.contains(value) {
            let allowed = allowed
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            errors.push(ValidationError::InvalidEnumValue {
                name: name.to_string(),
                allowed: format!("[{allowed}]"),
                value: value.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path_schema() -> ToolInputSchema {
        serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "mode": { "type": "string", "enum": ["r", "w"] },
                "limit": { "type": ["integer", "null"] }
            },
            "required": ["path"]
        }))
        .unwrap()
    }

    #[test]
    fn test_missing_required() {
        let errors = validate_arguments(&path_schema(), &json!({}));
        assert_eq!(errors, vec![ValidationError::MissingRequired { name: "path".into() }]);
    }

    #[test]
    fn test_type_mismatch() {
        let errors = validate_arguments(&path_schema(), &json!({"path": 42}));
        assert_eq!(
            errors,
            vec![ValidationError::TypeMismatch {
                name: "path".into(),
                expected: "string".into(),
                actual: "number".into(),
            }]
        );
    }

    #[test]
    fn test_valid_arguments() {
        assert!(validate_arguments(&path_schema(), &json!({"path": "/x"})).is_empty());
        assert!(validate_arguments(&path_schema(), &json!({"path": "/x", "mode": "w", "limit": null})).is_empty());
        assert!(validate_arguments(&path_schema(), &json!({"path": "/x", "limit": 5})).is_empty());
    }

    #[test]
    fn test_unknown_parameter_and_enum() {
        let errors = validate_arguments(&path_schema(), &json!({"path": "/x", "mode": "a", "force": true}));
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ValidationError::UnknownParameter { name: "force".into() }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidEnumValue { name, .. } if name == "mode")));
    }

    #[test]
    fn test_integer_rejects_fraction() {
        let errors = validate_arguments(&path_schema(), &json!({"path": "/x", "limit": 1.5}));
        assert!(matches!(errors[0], ValidationError::TypeMismatch { .. }));
    }

    #[test]
    fn test_integer_accepts_whole_float() {
        assert!(validate_arguments(&path_schema(), &json!({"path": "/x", "limit": 2.0})).is_empty());
    }

    #[test]
    fn test_non_object_arguments() {
        let errors = validate_arguments(&path_schema(), &json!(["path"]));
        assert_eq!(errors, vec![ValidationError::NotAnObject { actual: "array".into() }]);
    }

    #[test]
    fn test_null_arguments_treated_as_empty() {
        let errors = validate_arguments(&ToolInputSchema::default(), &Value::Null);
        assert!(errors.is_empty());
    }
}
