//! Write-path validation: raw input values against a field catalog.
//! Failures are structured `{field, message}` pairs and fail the whole
//! write; nothing is persisted partially.

use crate::catalog::{FieldCatalog, ValueType};
use crate::error::FieldError;
use serde_json::Value;

/// Validate user-supplied values for create/update. Returns the collected
/// field errors; empty means the values are acceptable.
pub fn validate_values(
    catalog: &FieldCatalog,
    values: &serde_json::Map<String, Value>,
) -> Vec<FieldError> {
    let mut errors = Vec::new();

    for (name, value) in values {
        let spec = match catalog.classify(name) {
            Some(spec) => spec,
            None => {
                errors.push(FieldError::new(name, "Unknown field"));
                continue;
            }
        };
        if spec.read_only {
            errors.push(FieldError::new(name, "Field is read-only"));
            continue;
        }
        if value.is_null() {
            // explicit null clears the field, any type accepts it
            continue;
        }
        if let Some(message) = type_mismatch(spec.value_type, value) {
            errors.push(FieldError::new(name, message));
        }
    }

    errors
}

fn type_mismatch(value_type: ValueType, value: &Value) -> Option<String> {
    let ok = match value_type {
        ValueType::String => value.is_string(),
        ValueType::Number => value.is_number() || parses_as_number(value),
        ValueType::Boolean => value.is_boolean(),
        // temporal input arrives as a calendar string or epoch millis
        ValueType::DateTime | ValueType::Date | ValueType::Time => {
            value.is_string() || value.is_number()
        }
        ValueType::Json => value.is_object() || value.is_array(),
    };
    if ok {
        None
    } else {
        Some(format!(
            "Expected {}, got {}",
            type_label(value_type),
            json_type_label(value)
        ))
    }
}

fn parses_as_number(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| s.trim().parse::<f64>().is_ok())
        .unwrap_or(false)
}

fn type_label(value_type: ValueType) -> &'static str {
    match value_type {
        ValueType::String => "string",
        ValueType::Number => "number",
        ValueType::Boolean => "boolean",
        ValueType::DateTime => "dateTime",
        ValueType::Date => "date",
        ValueType::Time => "time",
        ValueType::Json => "json",
    }
}

fn json_type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
