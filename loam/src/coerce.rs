//! Type-directed conversion of untyped filter operands and write values
//! into the storage representation of a field's declared value type.
//!
//! Coercion never fails hard: a value that cannot be converted yields
//! `None` and the caller drops the clause (with a diagnostic).

use crate::catalog::ValueType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Canonical timestamp text stored in dateTime columns.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Whether the coerced value is headed for a fixed column or an attribute
/// row. Attribute storage has no native temporal type, so instants are kept
/// as epoch millis there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceTarget {
    Column,
    Attribute,
}

/// A successfully coerced value, ready to bind as a SQL parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced {
    Text(String),
    Number(f64),
    Bool(bool),
    Millis(i64),
}

impl Coerced {
    pub fn to_sql(&self) -> rusqlite::types::Value {
        match self {
            Coerced::Text(s) => rusqlite::types::Value::Text(s.clone()),
            Coerced::Number(n) => rusqlite::types::Value::Real(*n),
            Coerced::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
            Coerced::Millis(ms) => rusqlite::types::Value::Integer(*ms),
        }
    }

    /// Text form for attribute-row storage (the value column is TEXT).
    pub fn to_attr_text(&self) -> String {
        match self {
            Coerced::Text(s) => s.clone(),
            Coerced::Number(n) => format_number(*n),
            Coerced::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Coerced::Millis(ms) => ms.to_string(),
        }
    }
}

/// Format a float without a trailing `.0` when it is integral.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn numeric_looking(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^-?\d+$").unwrap()).is_match(s)
}

/// Coerce a raw JSON value into the native representation for `value_type`.
/// Returns `None` on conversion failure; never errors.
pub fn coerce(
    raw: &serde_json::Value,
    value_type: ValueType,
    target: CoerceTarget,
) -> Option<Coerced> {
    match value_type {
        ValueType::String => match raw {
            serde_json::Value::String(s) => Some(Coerced::Text(s.clone())),
            serde_json::Value::Number(n) => Some(Coerced::Text(n.to_string())),
            serde_json::Value::Bool(b) => Some(Coerced::Text(b.to_string())),
            _ => None,
        },
        ValueType::Number => match raw {
            serde_json::Value::Number(n) => n.as_f64().map(Coerced::Number),
            // NaN is representable; callers validate separately if they care
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(Coerced::Number),
            serde_json::Value::Bool(b) => Some(Coerced::Number(f64::from(u8::from(*b)))),
            _ => None,
        },
        ValueType::Boolean => match raw {
            serde_json::Value::Bool(b) => Some(Coerced::Bool(*b)),
            serde_json::Value::String(s) => match s.as_str() {
                "true" | "t" => Some(Coerced::Bool(true)),
                "false" | "f" => Some(Coerced::Bool(false)),
                other => Some(Coerced::Bool(!other.is_empty())),
            },
            serde_json::Value::Number(n) => Some(Coerced::Bool(n.as_f64()? != 0.0)),
            _ => None,
        },
        ValueType::DateTime | ValueType::Date | ValueType::Time => {
            let instant = parse_instant(raw, value_type)?;
            match target {
                CoerceTarget::Column => {
                    let fmt = match value_type {
                        ValueType::DateTime => TIMESTAMP_FORMAT,
                        ValueType::Date => DATE_FORMAT,
                        ValueType::Time => TIME_FORMAT,
                        _ => unreachable!(),
                    };
                    Some(Coerced::Text(instant.format(fmt).to_string()))
                }
                CoerceTarget::Attribute => Some(Coerced::Millis(instant.timestamp_millis())),
            }
        }
        // json fields are never filterable and json write values bypass coercion
        ValueType::Json => None,
    }
}

/// Resolve a raw value to an instant: numeric-looking input is epoch millis,
/// anything else goes through calendar-string parsing.
fn parse_instant(raw: &serde_json::Value, value_type: ValueType) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::Number(n) => {
            let ms = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            DateTime::from_timestamp_millis(ms)
        }
        serde_json::Value::String(s) => {
            let s = s.trim();
            if numeric_looking(s) {
                return DateTime::from_timestamp_millis(s.parse().ok()?);
            }
            parse_calendar(s, value_type)
        }
        _ => None,
    }
}

fn parse_calendar(s: &str, value_type: ValueType) -> Option<DateTime<Utc>> {
    if value_type == ValueType::Time {
        // time-only fields are parsed against the epoch date
        let time = NaiveTime::parse_from_str(s, TIME_FORMAT)
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
            .ok()?;
        let date = NaiveDate::from_ymd_opt(1970, 1, 1)?;
        return Some(Utc.from_utc_datetime(&date.and_time(time)));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, DATE_FORMAT) {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}
