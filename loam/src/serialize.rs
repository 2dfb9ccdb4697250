//! Row materialization: a raw fetched row plus its attribute rows become
//! the record shape described by the field catalog, with hooks applied at
//! the documented points.

use crate::catalog::{EntityKind, FieldStorage, ValueType, Visibility};
use crate::db::RawRow;
use crate::error::Result;
use crate::populate;
use crate::store::Backend;
use serde_json::Value;
use std::collections::HashSet;

/// Materialize one fetched row. `selected` empty means "all selectable
/// fields"; `id` is always kept. Population, when requested, is
/// all-or-nothing: the record is returned fully populated or the call
/// errors.
pub fn serialize_row(
    backend: &Backend,
    kind: EntityKind,
    row: RawRow,
    selected: &[String],
    populate: bool,
) -> Result<Value> {
    let catalog = backend.catalog(kind);
    backend.hooks().check(kind, &row)?;

    let wanted: Vec<String> = if selected.is_empty() {
        catalog
            .field_names()
            .filter(|n| catalog.is_selectable(n) == Visibility::Allowed)
            .map(str::to_string)
            .collect()
    } else {
        selected.to_vec()
    };

    let id = row
        .get("id")
        .and_then(Value::as_i64)
        .unwrap_or_default();

    let needs_attrs = wanted.iter().any(|name| {
        catalog
            .classify(name)
            .map(|s| s.storage == FieldStorage::Attribute)
            .unwrap_or(false)
    });
    let attrs = if needs_attrs {
        backend.db().get_attrs(kind, id)?
    } else {
        Default::default()
    };

    let mut record = serde_json::Map::new();
    record.insert("id".into(), Value::from(id));

    // walk the catalog so output field order matches declaration order
    for (name, spec) in catalog.iter() {
        if name == "id" || !wanted.iter().any(|w| w == name) {
            continue;
        }
        match spec.storage {
            FieldStorage::Column => {
                let raw = row.get(name).cloned().unwrap_or(Value::Null);
                record.insert(name.to_string(), decode_column(raw, spec.value_type));
            }
            FieldStorage::Attribute => {
                let raw = attrs.get(name).and_then(|v| v.as_deref());
                record.insert(name.to_string(), decode_attr(raw, spec.value_type));
            }
        }
    }

    backend.hooks().on_read(kind, &mut record);

    if populate {
        let mut skip = HashSet::new();
        let subsets = populate::SubsetOverrides::new();
        populate::populate_record(backend, kind, id, &mut record, &subsets, &mut skip)?;
        backend.hooks().on_populate(kind, &mut record);
    }

    Ok(Value::Object(record))
}

fn decode_column(raw: Value, value_type: ValueType) -> Value {
    match value_type {
        ValueType::Json => match raw {
            Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::Null),
            other => other,
        },
        ValueType::Boolean => match raw {
            Value::Number(n) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            other => other,
        },
        _ => raw,
    }
}

/// Decode one attribute value per its declared type. Missing or NULL
/// attributes yield `null`.
pub fn decode_attr(raw: Option<&str>, value_type: ValueType) -> Value {
    let text = match raw {
        Some(text) => text,
        None => return Value::Null,
    };
    match value_type {
        ValueType::String => Value::String(text.to_string()),
        ValueType::Json => serde_json::from_str(text).unwrap_or(Value::Null),
        ValueType::Boolean => match text.parse::<f64>() {
            Ok(n) => Value::Bool(n != 0.0),
            Err(_) => Value::Bool(!text.is_empty()),
        },
        ValueType::Number | ValueType::DateTime | ValueType::Date | ValueType::Time => {
            match text.parse::<f64>() {
                Ok(n) => serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Err(_) => Value::Null,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_attr_boolean() {
        assert_eq!(decode_attr(Some("1"), ValueType::Boolean), json!(true));
        assert_eq!(decode_attr(Some("0"), ValueType::Boolean), json!(false));
        assert_eq!(decode_attr(None, ValueType::Boolean), json!(null));
    }

    #[test]
    fn test_decode_attr_number_and_temporal() {
        assert_eq!(decode_attr(Some("4.5"), ValueType::Number), json!(4.5));
        // dateTime attributes round-trip through epoch millis
        assert_eq!(
            decode_attr(Some("86400000"), ValueType::DateTime),
            json!(86_400_000.0)
        );
        assert_eq!(decode_attr(Some("junk"), ValueType::Number), json!(null));
    }

    #[test]
    fn test_decode_attr_json_and_string() {
        assert_eq!(
            decode_attr(Some(r#"{"a":1}"#), ValueType::Json),
            json!({"a": 1})
        );
        assert_eq!(decode_attr(Some("broken{"), ValueType::Json), json!(null));
        assert_eq!(decode_attr(Some("text"), ValueType::String), json!("text"));
    }

    #[test]
    fn test_decode_column_json_and_boolean() {
        assert_eq!(
            decode_column(json!("[{\"type\":\"t\",\"props\":{},\"children\":[]}]"), ValueType::Json),
            json!([{"type": "t", "props": {}, "children": []}])
        );
        assert_eq!(decode_column(json!(1), ValueType::Boolean), json!(true));
        assert_eq!(decode_column(json!(0), ValueType::Boolean), json!(false));
        assert_eq!(decode_column(Value::Null, ValueType::Boolean), json!(null));
    }
}
