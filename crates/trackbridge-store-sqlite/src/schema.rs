//! Fixed DDL, column type inference and SQL text builders.
//!
//! Entity tables are not declared here: they are created on first write from
//! the shape of the rows being stored. Only `sync_state` is fixed.

use chrono::NaiveDate;
use serde_json::Value;
use trackbridge_core::window::Moment;

/// Executed at connection startup; idempotent.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Singleton row holding the last successful full-sync watermark.
CREATE TABLE IF NOT EXISTS sync_state (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    last_sync   TEXT,             -- ISO 8601 UTC or NULL
    updated_at  TEXT
);

INSERT OR IGNORE INTO sync_state (id, last_sync, updated_at) VALUES (1, NULL, NULL);

PRAGMA user_version = 1;
";

// ─── Types ───────────────────────────────────────────────────────────────────

/// Declared type of a dynamically created column.
///
/// Every declared name ends in `BLOB`, which gives the column no affinity:
/// SQLite keeps each value in the storage class it was bound with, so a
/// string written into a column first seen as a date, flag or number is read
/// back as the same string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
  Boolean,
  BigInt,
  Double,
  Json,
  Date,
  Timestamp,
  Text,
}

impl SqlType {
  /// Infer from a sample value. Nulls give `Text`.
  pub fn infer(value: &Value) -> Self {
    match value {
      Value::Bool(_) => SqlType::Boolean,
      Value::Number(n) if n.is_i64() || n.is_u64() => SqlType::BigInt,
      Value::Number(_) => SqlType::Double,
      Value::Array(_) | Value::Object(_) => SqlType::Json,
      Value::String(s) => infer_str(s),
      Value::Null => SqlType::Text,
    }
  }

  pub fn decl(self) -> &'static str {
    match self {
      SqlType::Boolean => "BOOLEAN BLOB",
      SqlType::BigInt => "BIGNUM BLOB",
      SqlType::Double => "DOUBLE BLOB",
      SqlType::Json => "JSON BLOB",
      SqlType::Date => "DATE BLOB",
      SqlType::Timestamp => "TIMESTAMPTZ BLOB",
      SqlType::Text => "STRING BLOB",
    }
  }

  /// Recover the type from a declared name, ignoring case and the affinity
  /// suffix. Unknown names give `Text`.
  pub fn from_decl(decl: &str) -> Self {
    let head = decl.split_whitespace().next().unwrap_or_default();
    match head.to_ascii_uppercase().as_str() {
      "BOOLEAN" => SqlType::Boolean,
      "BIGNUM" | "BIGINT" => SqlType::BigInt,
      "DOUBLE" => SqlType::Double,
      "JSON" => SqlType::Json,
      "DATE" => SqlType::Date,
      "TIMESTAMPTZ" => SqlType::Timestamp,
      _ => SqlType::Text,
    }
  }
}

fn infer_str(s: &str) -> SqlType {
  let s = s.trim();
  if s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
    return SqlType::Date;
  }
  if s.len() >= 16 && matches!(Moment::parse(s), Ok(Moment::DateTime(_))) {
    return SqlType::Timestamp;
  }
  SqlType::Text
}

// ─── SQL text ────────────────────────────────────────────────────────────────

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String { format!("\"{}\"", name.replace('"', "\"\"")) }

pub fn create_table_sql(table: &str, key: &str, columns: &[(String, SqlType)]) -> String {
  let mut defs = vec![format!("{} TEXT PRIMARY KEY", quote_ident(key))];
  defs.extend(
    columns
      .iter()
      .filter(|(name, _)| !name.eq_ignore_ascii_case(key))
      .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.decl())),
  );
  format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table), defs.join(", "))
}

pub fn add_column_sql(table: &str, column: &str, ty: SqlType) -> String {
  format!(
    "ALTER TABLE {} ADD COLUMN {} {}",
    quote_ident(table),
    quote_ident(column),
    ty.decl()
  )
}

pub fn unique_index_sql(table: &str, key: &str) -> String {
  let name = format!("ux_{table}_{key}");
  format!(
    "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
    quote_ident(&name),
    quote_ident(table),
    quote_ident(key)
  )
}

/// Conflict-resolving insert over `columns`; the key keeps its value and
/// every other column takes the incoming one.
pub fn upsert_sql(table: &str, key: &str, columns: &[String]) -> String {
  let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
  let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
  let updates: Vec<String> = columns
    .iter()
    .filter(|c| !c.eq_ignore_ascii_case(key))
    .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
    .collect();

  let action = if updates.is_empty() {
    "DO NOTHING".to_owned()
  } else {
    format!("DO UPDATE SET {}", updates.join(", "))
  };

  format!(
    "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
    quote_ident(table),
    names.join(", "),
    placeholders.join(", "),
    quote_ident(key),
    action
  )
}
