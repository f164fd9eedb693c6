//! Value normalisation applied to every field before it becomes a row column.
//!
//! Remote payloads encode "no value" and booleans as free-form words. The
//! mapping lives in three explicit tables below so it can be audited and
//! tested. Any genuine free-text value that happens to equal one of these
//! words (a comment reading "none", say) is normalised too.
//!
//! Numeric-looking strings are never coerced: remote identifiers and codes
//! are often all digits and must keep their leading zeros.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Case-insensitive, trimmed spellings that mean "no value".
pub const ABSENT_WORDS: &[&str] = &["", "null", "none", "undefined", "nan"];

/// Case-insensitive, trimmed spellings of `true`.
pub const TRUE_WORDS: &[&str] = &["true", "yes", "oui"];

/// Case-insensitive, trimmed spellings of `false`.
pub const FALSE_WORDS: &[&str] = &["false", "no", "non"];

/// What a sentinel word normalises to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
  Absent,
  Bool(bool),
}

impl Sentinel {
  pub fn into_value(self) -> Value {
    match self {
      Sentinel::Absent => Value::Null,
      Sentinel::Bool(b) => Value::Bool(b),
    }
  }
}

/// Look `s` up in the normalisation tables.
pub fn classify(s: &str) -> Option<Sentinel> {
  let lowered = s.trim().to_lowercase();
  let word = lowered.as_str();
  if ABSENT_WORDS.contains(&word) {
    Some(Sentinel::Absent)
  } else if TRUE_WORDS.contains(&word) {
    Some(Sentinel::Bool(true))
  } else if FALSE_WORDS.contains(&word) {
    Some(Sentinel::Bool(false))
  } else {
    None
  }
}

/// Normalise a single string.
pub fn clean_str(s: &str) -> Value {
  match classify(s) {
    Some(sentinel) => sentinel.into_value(),
    None => Value::String(s.trim().to_owned()),
  }
}

/// Normalise a JSON value, recursing into arrays and objects.
///
/// Returns a new value; the input is left untouched.
pub fn clean(value: &Value) -> Value {
  match value {
    Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
    Value::String(s) => clean_str(s),
    Value::Array(items) => Value::Array(items.iter().map(clean).collect()),
    Value::Object(map) => Value::Object(
      map.iter().map(|(k, v)| (k.clone(), clean(v))).collect::<Map<_, _>>(),
    ),
  }
}

/// Remove every key in `keys` at every nesting level of `value`.
pub fn strip_keys(value: &mut Value, keys: &[&str]) {
  match value {
    Value::Array(items) => {
      for item in items {
        strip_keys(item, keys);
      }
    }
    Value::Object(map) => {
      for key in keys {
        map.remove(*key);
      }
      for nested in map.values_mut() {
        strip_keys(nested, keys);
      }
    }
    _ => {}
  }
}

// ─── Canonical forms ─────────────────────────────────────────────────────────

pub fn canonical_datetime(dt: DateTime<Utc>) -> Value {
  Value::String(dt.to_rfc3339())
}
