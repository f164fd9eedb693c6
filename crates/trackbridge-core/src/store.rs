//! The `RecordStore` trait.
//!
//! Implemented by storage backends (e.g. `trackbridge-store-sqlite`). The
//! sync orchestration depends on this abstraction, not on a concrete backend.
//!
//! Write operations report success as a `bool` rather than an error: a row
//! that cannot be written after retries is logged and routed to the audit
//! sink, and the sync carries on with the next one.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::entity::Row;

/// Equality filters for [`RecordStore::list_ids`]: column → value.
pub type Filters = Vec<(String, Value)>;

pub trait RecordStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Writes ────────────────────────────────────────────────────────────

  /// Insert or update one row keyed on `key_column`.
  fn upsert_one<'a>(
    &'a self,
    table: &'a str,
    row: Row,
    key_column: &'a str,
  ) -> impl Future<Output = bool> + Send + 'a;

  /// Insert or update many rows in batches.
  fn upsert_bulk<'a>(
    &'a self,
    table: &'a str,
    rows: Vec<Row>,
    key_column: &'a str,
  ) -> impl Future<Output = bool> + Send + 'a;

  /// Returns whether a row was removed.
  fn delete_one<'a>(
    &'a self,
    table: &'a str,
    key_column: &'a str,
    id: &'a str,
  ) -> impl Future<Output = bool> + Send + 'a;

  /// Returns whether any row was removed.
  fn delete_bulk<'a>(
    &'a self,
    table: &'a str,
    key_column: &'a str,
    ids: Vec<String>,
  ) -> impl Future<Output = bool> + Send + 'a;

  // ── Sync state ────────────────────────────────────────────────────────

  fn last_sync(
    &self,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_;

  fn record_sync(
    &self,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Key values of every row in `table` matching all `filters`. A missing
  /// table yields an empty list.
  fn list_ids<'a>(
    &'a self,
    table: &'a str,
    filters: Filters,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

  /// Run a read-only query with positional parameters.
  fn query_rows<'a>(
    &'a self,
    sql: &'a str,
    params: Vec<Value>,
  ) -> impl Future<Output = Result<Vec<Row>, Self::Error>> + Send + 'a;
}
