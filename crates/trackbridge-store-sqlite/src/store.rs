//! [`SqliteStore`]: the schema-adaptive SQLite implementation of
//! [`RecordStore`].

use std::{
  collections::{BTreeMap, HashMap, HashSet},
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  time::Duration,
};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension as _, params_from_iter, types::Value as SqlValue};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use trackbridge_core::{
  clean::canonical_datetime,
  entity::{KEY_COLUMN, Row, SYNCED_AT_COLUMN},
  retry::RetryPolicy,
  store::{Filters, RecordStore},
};

use crate::{
  Error, Result,
  cache::SchemaCache,
  encode::{decode_dt, encode_dt, from_sql, to_sql},
  error::is_duplicate_column,
  schema::{
    SCHEMA, SqlType, add_column_sql, create_table_sql, quote_ident, unique_index_sql,
    upsert_sql,
  },
  sink::LocalSink,
};

/// Ceiling on bound parameters per statement, under SQLite's own limit.
const MAX_PARAMS: usize = 32_000;

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreOptions {
  /// Rows per transaction on the bulk paths.
  pub batch_size:   usize,
  /// Single-row writes: retried on any error.
  pub row_retry:    RetryPolicy,
  /// Bulk writes and deletes: retried only on transient errors.
  pub batch_retry:  RetryPolicy,
  /// Ignore the schema cache and consult the catalog on every check.
  pub force_reinit: bool,
  pub busy_timeout: Duration,
  pub audit_dir:    Option<PathBuf>,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      batch_size:   10_000,
      row_retry:    RetryPolicy::fixed(3, Duration::from_secs(3)),
      batch_retry:  RetryPolicy::exponential(3, Duration::from_secs(3), 2.0),
      force_reinit: false,
      busy_timeout: Duration::from_secs(30),
      audit_dir:    None,
    }
  }
}

impl StoreOptions {
  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  pub fn with_row_retry(mut self, policy: RetryPolicy) -> Self {
    self.row_retry = policy;
    self
  }

  pub fn with_batch_retry(mut self, policy: RetryPolicy) -> Self {
    self.batch_retry = policy;
    self
  }

  pub fn with_force_reinit(mut self, force: bool) -> Self {
    self.force_reinit = force;
    self
  }

  pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.audit_dir = Some(dir.into());
    self
  }
}

/// Result of [`SqliteStore::refresh_view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
  Refreshed { rows: usize },
  /// Another refresh held the lock.
  Skipped,
}

// ─── Store ───────────────────────────────────────────────────────────────────

struct Shared {
  options:         StoreOptions,
  cache:           SchemaCache,
  table_locks:     Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
  refreshing:      AtomicBool,
  catalog_queries: AtomicU64,
  sink:            Option<LocalSink>,
}

/// A record store backed by a single SQLite file.
///
/// Cloning is cheap; clones share the connection, the schema cache and the
/// refresh lock.
#[derive(Clone)]
pub struct SqliteStore {
  conn:   tokio_rusqlite::Connection,
  shared: Arc<Shared>,
}

pub(crate) struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
  fn drop(&mut self) { self.0.store(false, Ordering::Release); }
}

impl SqliteStore {
  /// Open (or create) a store at `path` with default options.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, StoreOptions::default()).await
  }

  pub async fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, options).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    Self::open_in_memory_with(StoreOptions::default()).await
  }

  pub async fn open_in_memory_with(options: StoreOptions) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, options).await
  }

  async fn init(conn: tokio_rusqlite::Connection, options: StoreOptions) -> Result<Self> {
    let busy = options.busy_timeout;
    conn
      .call(move |conn| {
        conn.busy_timeout(busy)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;

    let sink = options.audit_dir.clone().map(LocalSink::new);
    Ok(Self {
      conn,
      shared: Arc::new(Shared {
        options,
        cache: SchemaCache::default(),
        table_locks: Mutex::new(HashMap::new()),
        refreshing: AtomicBool::new(false),
        catalog_queries: AtomicU64::new(0),
        sink,
      }),
    })
  }

  pub fn options(&self) -> &StoreOptions { &self.shared.options }

  /// Number of catalog lookups issued so far.
  pub fn catalog_queries(&self) -> u64 { self.shared.catalog_queries.load(Ordering::Relaxed) }

  fn note_catalog_query(&self) { self.shared.catalog_queries.fetch_add(1, Ordering::Relaxed); }

  fn force(&self) -> bool { self.shared.options.force_reinit }

  #[cfg(test)]
  pub(crate) fn connection(&self) -> &tokio_rusqlite::Connection { &self.conn }

  fn table_lock(&self, table: &str) -> Arc<AsyncMutex<()>> {
    let mut locks = self.shared.table_locks.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(table.to_owned()).or_default().clone()
  }

  pub(crate) fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
    self
      .shared
      .refreshing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| RefreshGuard(&self.shared.refreshing))
  }

  async fn audit_failed(&self, table: &str, row: &Row, error: &str) {
    if let Some(sink) = &self.shared.sink {
      sink.record_failed(table, row, error).await;
    }
  }

  async fn audit_deleted(&self, table: &str, ids: &[String]) {
    if let Some(sink) = &self.shared.sink {
      sink.record_deleted(table, ids).await;
    }
  }

  // ── Schema ────────────────────────────────────────────────────────────

  /// Whether `table` exists, consulting the cache first.
  pub async fn table_exists(&self, table: &str) -> Result<bool> {
    if !self.force() && self.shared.cache.has_table(table) {
      return Ok(true);
    }
    self.note_catalog_query();
    let t = table.to_owned();
    let exists = self.conn.call(move |conn| Ok(catalog_has_table(conn, &t)?)).await?;
    if exists {
      self.shared.cache.mark_table(table);
    }
    Ok(exists)
  }

  /// Create `table` from the shape of `sample` if it does not exist yet.
  pub async fn ensure_table(&self, table: &str, sample: &Row, key: &str) -> Result<()> {
    if !self.force() && self.shared.cache.has_table(table) {
      return Ok(());
    }
    let lock = self.table_lock(table);
    let _guard = lock.lock().await;
    if !self.force() && self.shared.cache.has_table(table) {
      return Ok(());
    }

    let columns: Vec<(String, SqlType)> = sample
      .iter()
      .map(|(name, value)| {
        let ty = if name.eq_ignore_ascii_case(key) { SqlType::Text } else { SqlType::infer(value) };
        (name.clone(), ty)
      })
      .collect();
    let sql = create_table_sql(table, key, &columns);

    self.note_catalog_query();
    let t = table.to_owned();
    let created = self
      .conn
      .call(move |conn| {
        if catalog_has_table(conn, &t)? {
          return Ok(false);
        }
        conn.execute(&sql, [])?;
        Ok(true)
      })
      .await?;

    if created {
      info!(table, columns = columns.len(), "created table");
      let names = columns.iter().map(|(n, _)| n.as_str()).chain([key]);
      self.shared.cache.mark_columns(table, names);
      self.shared.cache.mark_key(table, key);
    }
    self.shared.cache.mark_table(table);
    Ok(())
  }

  /// Add every column of `columns` the table does not have yet.
  pub async fn ensure_columns(&self, table: &str, columns: &[(String, SqlType)]) -> Result<()> {
    let names = || columns.iter().map(|(n, _)| n.as_str());
    let pending = |store: &Self| -> Vec<String> {
      if store.force() {
        names().map(str::to_owned).collect()
      } else {
        store.shared.cache.missing_columns(table, names()).into_iter().map(str::to_owned).collect()
      }
    };

    if pending(self).is_empty() {
      return Ok(());
    }
    let lock = self.table_lock(table);
    let _guard = lock.lock().await;
    let missing = pending(self);
    if missing.is_empty() {
      return Ok(());
    }

    let wanted: Vec<(String, SqlType)> =
      columns.iter().filter(|(n, _)| missing.contains(n)).cloned().collect();

    self.note_catalog_query();
    let t = table.to_owned();
    let (live, added) = self
      .conn
      .call(move |conn| {
        let live: Vec<String> = catalog_columns(conn, &t)?.into_iter().map(|(n, _)| n).collect();
        let mut known: HashSet<String> = live.iter().map(|n| n.to_lowercase()).collect();
        let mut added = Vec::new();
        for (name, ty) in wanted {
          if !known.insert(name.to_lowercase()) {
            continue;
          }
          match conn.execute(&add_column_sql(&t, &name, ty), []) {
            Ok(_) => added.push(name),
            Err(e) if is_duplicate_column(&e) => {}
            Err(e) => return Err(e.into()),
          }
        }
        Ok((live, added))
      })
      .await?;

    if !added.is_empty() {
      info!(table, ?added, "added columns");
    }
    self
      .shared
      .cache
      .mark_columns(table, live.iter().chain(added.iter()).map(String::as_str));
    Ok(())
  }

  /// Make sure `key` is backed by a primary key or a single-column unique
  /// index, creating the index if needed.
  pub async fn ensure_unique(&self, table: &str, key: &str) -> Result<()> {
    if !self.force() && self.shared.cache.has_key(table, key) {
      return Ok(());
    }
    let lock = self.table_lock(table);
    let _guard = lock.lock().await;
    if !self.force() && self.shared.cache.has_key(table, key) {
      return Ok(());
    }

    self.note_catalog_query();
    let (t, k) = (table.to_owned(), key.to_owned());
    let created = self
      .conn
      .call(move |conn| {
        if catalog_key_is_unique(conn, &t, &k)? {
          return Ok(false);
        }
        conn.execute(&unique_index_sql(&t, &k), [])?;
        Ok(true)
      })
      .await?;

    if created {
      info!(table, key, "created unique index");
    }
    self.shared.cache.mark_key(table, key);
    Ok(())
  }

  // ── Write internals ───────────────────────────────────────────────────

  async fn upsert_once(&self, table: &str, row: &Row, key: &str, id: &str) -> Result<bool> {
    self.ensure_table(table, row, key).await?;
    self.ensure_columns(table, &column_types(std::slice::from_ref(row), key)).await?;

    let qt = quote_ident(table);
    let qk = quote_ident(key);
    let id = id.to_owned();
    let mut sets = Vec::new();
    let mut set_values = Vec::new();
    for (column, value) in row.iter().filter(|(c, _)| !c.eq_ignore_ascii_case(key)) {
      sets.push(format!("{} = ?{}", quote_ident(column), sets.len() + 1));
      set_values.push(to_sql(value));
    }
    let update = format!("UPDATE {qt} SET {} WHERE {qk} = ?{}", sets.join(", "), sets.len() + 1);
    set_values.push(SqlValue::Text(id.clone()));

    let names: Vec<String> = row.keys().map(|c| quote_ident(c)).collect();
    let marks: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let insert = format!("INSERT INTO {qt} ({}) VALUES ({})", names.join(", "), marks.join(", "));
    let insert_values: Vec<SqlValue> = row.values().map(to_sql).collect();
    let exists_sql = format!("SELECT 1 FROM {qt} WHERE {qk} = ?1");
    let has_payload = !sets.is_empty();

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let exists = tx
          .query_row(&exists_sql, rusqlite::params![id], |_| Ok(()))
          .optional()?
          .is_some();
        if !exists {
          tx.execute(&insert, params_from_iter(insert_values.iter()))?;
        } else if has_payload {
          tx.execute(&update, params_from_iter(set_values.iter()))?;
        }
        tx.commit()?;
        Ok(!exists)
      })
      .await?;
    Ok(inserted)
  }

  async fn ensure_bulk_schema(
    &self,
    table: &str,
    sample: &Row,
    columns: &[(String, SqlType)],
    key: &str,
  ) -> Result<()> {
    self.ensure_table(table, sample, key).await?;
    self.ensure_columns(table, columns).await?;
    self.ensure_unique(table, key).await
  }

  async fn write_batch(&self, sql: &str, rows: &[Vec<SqlValue>]) -> Result<usize> {
    let sql = sql.to_owned();
    let rows = rows.to_vec();
    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let mut written = 0;
        {
          let mut stmt = tx.prepare(&sql)?;
          for row in &rows {
            written += stmt.execute(params_from_iter(row.iter()))?;
          }
        }
        tx.commit()?;
        Ok(written)
      })
      .await?;
    Ok(written)
  }

  async fn delete_chunk(&self, table: &str, key: &str, ids: &[String]) -> Result<usize> {
    let marks: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
      "DELETE FROM {} WHERE {} IN ({})",
      quote_ident(table),
      quote_ident(key),
      marks.join(", ")
    );
    let ids = ids.to_vec();
    let removed = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let removed = tx.execute(&sql, params_from_iter(ids.iter()))?;
        tx.commit()?;
        Ok(removed)
      })
      .await?;
    Ok(removed)
  }

  // ── Reads ─────────────────────────────────────────────────────────────

  /// Rows of `table` matching every filter, decoded using the declared
  /// column types. A missing table yields no rows.
  pub async fn list_rows(
    &self,
    table: &str,
    filters: &[(String, Value)],
    order_by: Option<&str>,
  ) -> Result<Vec<Row>> {
    if !self.table_exists(table).await? {
      return Ok(Vec::new());
    }

    let mut sql = format!("SELECT * FROM {}", quote_ident(table));
    if !filters.is_empty() {
      let clauses: Vec<String> = filters
        .iter()
        .enumerate()
        .map(|(i, (column, _))| format!("{} = ?{}", quote_ident(column), i + 1))
        .collect();
      sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    if let Some(column) = order_by {
      sql.push_str(&format!(" ORDER BY {}", quote_ident(column)));
    }
    let params: Vec<SqlValue> = filters.iter().map(|(_, v)| to_sql(v)).collect();
    let t = table.to_owned();

    let rows = self
      .conn
      .call(move |conn| {
        let decls: HashMap<String, String> = catalog_columns(conn, &t)?
          .into_iter()
          .map(|(name, decl)| (name.to_lowercase(), decl))
          .collect();
        Ok(read_rows(conn, &sql, &params, |name| decls.get(&name.to_lowercase()).cloned())?)
      })
      .await?;
    Ok(rows)
  }

  /// Rebuild the materialised table `name` from `select_sql`, then index it
  /// on `key`. Only one refresh runs at a time; a concurrent request is
  /// skipped rather than queued.
  pub async fn refresh_view(&self, name: &str, select_sql: &str, key: &str) -> Result<RefreshOutcome> {
    let Some(_guard) = self.try_begin_refresh() else {
      info!(view = name, "refresh already in progress, skipping");
      return Ok(RefreshOutcome::Skipped);
    };

    let started = std::time::Instant::now();
    let (n, k) = (name.to_owned(), key.to_owned());
    let select = select_sql.trim().trim_end_matches(';').to_owned();
    let result = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let view = quote_ident(&n);
        tx.execute(&format!("DROP TABLE IF EXISTS {view}"), [])?;
        tx.execute(&format!("CREATE TABLE {view} AS {select}"), [])?;
        let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {view}"), [], |r| r.get(0))?;
        tx.execute(&unique_index_sql(&n, &k), [])?;
        tx.commit()?;
        Ok(rows)
      })
      .await;

    match result {
      Ok(rows) => {
        let rows = usize::try_from(rows).unwrap_or_default();
        info!(view = name, rows, elapsed = ?started.elapsed(), "refreshed view");
        Ok(RefreshOutcome::Refreshed { rows })
      }
      Err(e) => {
        error!(view = name, error = %e, "view refresh failed");
        Err(e.into())
      }
    }
  }
}

// ─── Trait impl ──────────────────────────────────────────────────────────────

impl RecordStore for SqliteStore {
  type Error = Error;

  async fn upsert_one<'a>(&'a self, table: &'a str, mut row: Row, key_column: &'a str) -> bool {
    let Some(id) = key_of(&row, key_column) else {
      let err = Error::MissingKey { table: table.to_owned(), key: key_column.to_owned() };
      warn!(table, error = %err, "rejecting row");
      self.audit_failed(table, &row, &err.to_string()).await;
      return false;
    };
    row.insert(SYNCED_AT_COLUMN.to_owned(), canonical_datetime(Utc::now()));

    let (row_ref, id_ref) = (&row, id.as_str());
    let outcome = self
      .shared
      .options
      .row_retry
      .run(
        "upsert_one",
        move || self.upsert_once(table, row_ref, key_column, id_ref),
        |_| true,
      )
      .await;

    match outcome {
      Ok(inserted) => {
        debug!(table, id = %id, inserted, "upserted row");
        true
      }
      Err(e) => {
        error!(table, id = %id, error = %e, "giving up on row");
        self.audit_failed(table, &row, &e.to_string()).await;
        false
      }
    }
  }

  async fn upsert_bulk<'a>(&'a self, table: &'a str, rows: Vec<Row>, key_column: &'a str) -> bool {
    if rows.is_empty() {
      return true;
    }

    let stamp = canonical_datetime(Utc::now());
    let mut keyed = Vec::with_capacity(rows.len());
    let mut rejected = 0usize;
    for mut row in rows {
      if key_of(&row, key_column).is_none() {
        rejected += 1;
        let err = Error::MissingKey { table: table.to_owned(), key: key_column.to_owned() };
        self.audit_failed(table, &row, &err.to_string()).await;
        continue;
      }
      row.insert(SYNCED_AT_COLUMN.to_owned(), stamp.clone());
      keyed.push(row);
    }
    if rejected > 0 {
      warn!(table, rejected, "rows without a key were not written");
    }
    let Some(sample) = keyed.first() else {
      return false;
    };

    let columns = column_types(&keyed, key_column);
    let policy = self.shared.options.batch_retry;
    let schema = policy
      .run(
        "ensure_schema",
        || self.ensure_bulk_schema(table, sample, &columns, key_column),
        Error::is_transient,
      )
      .await;
    if let Err(e) = schema {
      error!(table, error = %e, "could not prepare table for bulk upsert");
      return false;
    }

    let names: Vec<String> = columns.into_iter().map(|(n, _)| n).collect();
    let sql = upsert_sql(table, key_column, &names);
    let batch_size = self.shared.options.batch_size.max(1);
    let mut written = 0;

    for (batch, chunk) in keyed.chunks(batch_size).enumerate() {
      let values: Vec<Vec<SqlValue>> = chunk
        .iter()
        .map(|row| names.iter().map(|c| row.get(c).map_or(SqlValue::Null, to_sql)).collect())
        .collect();

      let outcome = policy
        .run("upsert_bulk", || self.write_batch(&sql, &values), Error::is_transient)
        .await;
      match outcome {
        Ok(n) => {
          debug!(table, batch, rows = n, "committed batch");
          written += n;
        }
        Err(e) => {
          let first_rows = preview(chunk);
          error!(table, batch, %sql, error = %e, %first_rows, "bulk upsert aborted");
          return false;
        }
      }
    }

    info!(table, rows = written, "bulk upsert complete");
    rejected == 0
  }

  async fn delete_one<'a>(&'a self, table: &'a str, key_column: &'a str, id: &'a str) -> bool {
    self.delete_bulk(table, key_column, vec![id.to_owned()]).await
  }

  async fn delete_bulk<'a>(&'a self, table: &'a str, key_column: &'a str, ids: Vec<String>) -> bool {
    let mut seen = HashSet::new();
    let ids: Vec<String> = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
    if ids.is_empty() {
      return false;
    }

    match self.table_exists(table).await {
      Ok(true) => {}
      Ok(false) => {
        debug!(table, "nothing to delete from a missing table");
        return false;
      }
      Err(e) => {
        error!(table, error = %e, "could not check table before delete");
        return false;
      }
    }

    let policy = self.shared.options.batch_retry;
    let chunk_size = self.shared.options.batch_size.clamp(1, MAX_PARAMS);
    let mut removed = 0;
    for chunk in ids.chunks(chunk_size) {
      let outcome = policy
        .run("delete", || self.delete_chunk(table, key_column, chunk), Error::is_transient)
        .await;
      match outcome {
        Ok(n) => removed += n,
        Err(e) => {
          error!(table, ids = chunk.len(), error = %e, "delete aborted");
          return false;
        }
      }
    }

    info!(table, requested = ids.len(), removed, "deleted rows");
    self.audit_deleted(table, &ids).await;
    removed > 0
  }

  async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = self
      .conn
      .call(|conn| {
        Ok(conn.query_row("SELECT last_sync FROM sync_state WHERE id = 1", [], |r| r.get(0))?)
      })
      .await?;
    raw.as_deref().map(decode_dt).transpose()
  }

  async fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
    let at = encode_dt(at);
    let now = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE sync_state SET last_sync = ?1, updated_at = ?2 WHERE id = 1",
          rusqlite::params![at, now],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn list_ids<'a>(&'a self, table: &'a str, filters: Filters) -> Result<Vec<String>> {
    let rows = self.list_rows(table, &filters, Some(KEY_COLUMN)).await?;
    Ok(rows
      .into_iter()
      .filter_map(|mut row| match row.remove(KEY_COLUMN) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
      })
      .collect())
  }

  async fn query_rows<'a>(&'a self, sql: &'a str, params: Vec<Value>) -> Result<Vec<Row>> {
    let sql = sql.to_owned();
    let params: Vec<SqlValue> = params.iter().map(to_sql).collect();
    let rows = self
      .conn
      .call(move |conn| Ok(read_rows(conn, &sql, &params, |_| None)?))
      .await?;
    Ok(rows)
  }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn key_of(row: &Row, key: &str) -> Option<String> {
  match row.get(key)? {
    Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Union of columns across `rows`, typed from the first non-null value seen.
fn column_types(rows: &[Row], key: &str) -> Vec<(String, SqlType)> {
  let mut seen: BTreeMap<String, Option<SqlType>> = BTreeMap::new();
  for row in rows {
    for (column, value) in row {
      let slot = seen.entry(column.clone()).or_default();
      if slot.is_none() && !value.is_null() {
        *slot = Some(SqlType::infer(value));
      }
    }
  }
  seen
    .into_iter()
    .map(|(column, ty)| {
      let ty = if column.eq_ignore_ascii_case(key) { SqlType::Text } else { ty.unwrap_or(SqlType::Text) };
      (column, ty)
    })
    .collect()
}

fn preview(rows: &[Row]) -> String {
  serde_json::to_string(&rows[..rows.len().min(3)]).unwrap_or_default()
}

fn catalog_has_table(conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<bool> {
  Ok(
    conn
      .query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |_| Ok(()),
      )
      .optional()?
      .is_some(),
  )
}

/// `(name, declared type)` for each column of `table`.
fn catalog_columns(
  conn: &rusqlite::Connection,
  table: &str,
) -> rusqlite::Result<Vec<(String, String)>> {
  let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
  let cols = stmt
    .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(cols)
}

fn catalog_key_is_unique(
  conn: &rusqlite::Connection,
  table: &str,
  key: &str,
) -> rusqlite::Result<bool> {
  let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
  let pk: Vec<String> = stmt
    .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, i64>(5)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .filter(|(_, pk)| *pk > 0)
    .map(|(name, _)| name)
    .collect();
  if let [only] = pk.as_slice() {
    if only.eq_ignore_ascii_case(key) {
      return Ok(true);
    }
  }

  let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
  let unique: Vec<String> = stmt
    .query_map([], |r| Ok((r.get::<_, String>(1)?, r.get::<_, i64>(2)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?
    .into_iter()
    .filter(|(_, unique)| *unique != 0)
    .map(|(name, _)| name)
    .collect();

  for index in unique {
    let mut stmt = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(&index)))?;
    let cols: Vec<String> = stmt
      .query_map([], |r| r.get::<_, Option<String>>(2))?
      .collect::<rusqlite::Result<Vec<_>>>()?
      .into_iter()
      .flatten()
      .collect();
    if let [only] = cols.as_slice() {
      if only.eq_ignore_ascii_case(key) {
        return Ok(true);
      }
    }
  }
  Ok(false)
}

fn read_rows(
  conn: &rusqlite::Connection,
  sql: &str,
  params: &[SqlValue],
  decl_of: impl Fn(&str) -> Option<String>,
) -> rusqlite::Result<Vec<Row>> {
  let mut stmt = conn.prepare(sql)?;
  let names: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
  let decls: Vec<Option<String>> = names.iter().map(|n| decl_of(n)).collect();
  let rows = stmt
    .query_map(params_from_iter(params.iter()), |r| {
      let mut row = Row::new();
      for (i, name) in names.iter().enumerate() {
        row.insert(name.clone(), from_sql(r.get_ref(i)?, decls[i].as_deref()));
      }
      Ok(row)
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}
