//! Conversion between JSON row values and SQLite column values.
//!
//! Timestamps are stored as RFC 3339 strings, booleans as 0/1 integers, and
//! arrays/objects as compact JSON text. Reads restore booleans and JSON from
//! the column's declared type when it is known; any other stored value is
//! returned in its own storage class.

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{Number, Value};

use crate::{Error, Result, schema::SqlType};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Values ──────────────────────────────────────────────────────────────────

pub fn to_sql(value: &Value) -> SqlValue {
  match value {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Number(n) => match n.as_i64() {
      Some(i) => SqlValue::Integer(i),
      None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
    },
    Value::String(s) => SqlValue::Text(s.clone()),
    Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
  }
}

/// Decode one column. `decl` is the declared column type, when known.
pub fn from_sql(value: ValueRef<'_>, decl: Option<&str>) -> Value {
  let ty = decl.map(SqlType::from_decl);
  match (value, ty) {
    (ValueRef::Null, _) => Value::Null,
    (ValueRef::Integer(i @ (0 | 1)), Some(SqlType::Boolean)) => Value::Bool(i == 1),
    (ValueRef::Integer(i), _) => Value::from(i),
    (ValueRef::Real(f), _) => Number::from_f64(f).map_or(Value::Null, Value::Number),
    (ValueRef::Text(t), Some(SqlType::Json)) => {
      let text = String::from_utf8_lossy(t);
      decode_json(&text).unwrap_or_else(|| Value::String(text.into_owned()))
    }
    (ValueRef::Text(t), _) => Value::String(String::from_utf8_lossy(t).into_owned()),
    (ValueRef::Blob(b), _) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
  }
}

/// Only arrays and objects are written as JSON text; any other text in a
/// JSON column was stored as a plain string.
fn decode_json(text: &str) -> Option<Value> {
  if !text.starts_with(['{', '[']) {
    return None;
  }
  serde_json::from_str(text).ok()
}
