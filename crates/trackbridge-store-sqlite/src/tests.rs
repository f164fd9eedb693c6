//! Integration tests for `SqliteStore` against an in-memory database.

use std::{
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use chrono::{TimeZone as _, Utc};
use rusqlite::functions::FunctionFlags;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use trackbridge_core::{entity::Row, retry::RetryPolicy, store::RecordStore};

use crate::{RefreshOutcome, SqliteStore, StoreOptions};

fn options() -> StoreOptions {
  StoreOptions::default()
    .with_row_retry(RetryPolicy::fixed(2, Duration::ZERO))
    .with_batch_retry(RetryPolicy::exponential(2, Duration::ZERO, 2.0))
}

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory_with(options())
    .await
    .expect("in-memory store")
}

fn row(v: Value) -> Row { serde_json::from_value(v).expect("object") }

fn without_stamp(mut r: Row) -> Row {
  r.remove("synced_at");
  r
}

async fn all(s: &SqliteStore, table: &str) -> Vec<Row> {
  s.list_rows(table, &[], Some("id")).await.unwrap()
}

// ─── Single-row upsert ───────────────────────────────────────────────────────

#[tokio::test]
async fn upsert_one_creates_table_and_stores_row() {
  let s = store().await;
  let input = row(json!({
    "id": "T1",
    "name": "Ama",
    "deleted": false,
    "level": 3,
    "parent": {"id": "P"}
  }));

  assert!(s.upsert_one("people", input.clone(), "id").await);

  let rows = all(&s, "people").await;
  assert_eq!(rows.len(), 1);
  assert!(rows[0]["synced_at"].is_string());
  assert_eq!(without_stamp(rows[0].clone()), input);
}

#[tokio::test]
async fn upsert_one_is_idempotent() {
  let s = store().await;
  let input = row(json!({"id": "E1", "status": "ACTIVE"}));

  assert!(s.upsert_one("enrollments", input.clone(), "id").await);
  assert!(s.upsert_one("enrollments", input.clone(), "id").await);

  let rows = all(&s, "enrollments").await;
  assert_eq!(rows.len(), 1);
  assert_eq!(without_stamp(rows[0].clone()), input);
}

#[tokio::test]
async fn upsert_one_updates_existing_row() {
  let s = store().await;
  s.upsert_one("events", row(json!({"id": "V1", "status": "ACTIVE"})), "id").await;
  s.upsert_one("events", row(json!({"id": "V1", "status": "COMPLETED"})), "id").await;

  let rows = all(&s, "events").await;
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0]["status"], json!("COMPLETED"));
}

#[tokio::test]
async fn numeric_looking_strings_stay_strings() {
  let s = store().await;
  s.upsert_one("events", row(json!({"id": "V1", "DE1": "5"})), "id").await;

  let rows = all(&s, "events").await;
  assert_eq!(rows[0]["DE1"], json!("5"));
}

#[tokio::test]
async fn later_values_keep_their_own_type() {
  let s = store().await;
  let first = row(json!({"id": "V1", "DE1": true, "DE2": "2024-01-31", "DE3": 4, "DE4": [1]}));
  let second = row(json!({"id": "V2", "DE1": "007", "DE2": "12", "DE3": "0.50", "DE4": "12"}));
  let third = row(json!({"id": "V3", "DE1": 7, "DE2": 12, "DE3": "x", "DE4": 2.5}));
  for r in [&first, &second, &third] {
    assert!(s.upsert_one("events", r.clone(), "id").await);
  }

  let stored: Vec<Row> = all(&s, "events").await.into_iter().map(without_stamp).collect();
  assert_eq!(stored, [first, second, third]);
}

#[tokio::test]
async fn row_without_key_is_rejected() {
  let s = store().await;
  assert!(!s.upsert_one("events", row(json!({"status": "ACTIVE"})), "id").await);
  assert!(!s.upsert_one("events", row(json!({"id": null})), "id").await);
  assert!(!s.table_exists("events").await.unwrap());
}

// ─── Schema growth ───────────────────────────────────────────────────────────

#[tokio::test]
async fn identical_second_upsert_needs_no_catalog_query() {
  let s = store().await;
  let r = row(json!({"id": "V1", "DE1": "5"}));

  s.upsert_one("events", r.clone(), "id").await;
  let after_first = s.catalog_queries();
  s.upsert_one("events", r, "id").await;
  assert_eq!(s.catalog_queries(), after_first);
}

#[tokio::test]
async fn new_column_is_added_once() {
  let s = store().await;
  s.upsert_one("events", row(json!({"id": "V1", "DE1": "5"})), "id").await;
  let before = s.catalog_queries();

  s.upsert_one("events", row(json!({"id": "V2", "DE1": "1", "DE2": "x"})), "id").await;
  assert_eq!(s.catalog_queries(), before + 1);

  s.upsert_one("events", row(json!({"id": "V3", "DE1": "2", "DE2": "y"})), "id").await;
  assert_eq!(s.catalog_queries(), before + 1);

  let rows = all(&s, "events").await;
  assert_eq!(rows.len(), 3);
  assert_eq!(rows[0]["DE2"], Value::Null);
  assert_eq!(rows[2]["DE2"], json!("y"));
}

#[tokio::test]
async fn column_names_compare_case_insensitively() {
  let s = store().await;
  s.upsert_one("events", row(json!({"id": "V1", "de1": "5"})), "id").await;
  assert!(s.upsert_one("events", row(json!({"id": "V2", "DE1": "6"})), "id").await);
  assert_eq!(all(&s, "events").await.len(), 2);
}

#[tokio::test]
async fn force_reinit_always_consults_the_catalog() {
  let s = SqliteStore::open_in_memory_with(options().with_force_reinit(true)).await.unwrap();
  let r = row(json!({"id": "V1", "DE1": "5"}));

  s.upsert_one("events", r.clone(), "id").await;
  let after_first = s.catalog_queries();
  s.upsert_one("events", r, "id").await;
  assert!(s.catalog_queries() > after_first);
}

#[tokio::test]
async fn unique_index_is_created_once() {
  let s = store().await;
  s.ensure_table("people", &row(json!({"id": "P1", "email": "a@b"})), "id").await.unwrap();

  s.ensure_unique("people", "email").await.unwrap();
  let after = s.catalog_queries();
  s.ensure_unique("people", "email").await.unwrap();
  assert_eq!(s.catalog_queries(), after);

  let rows = vec![
    row(json!({"id": "P1", "email": "a@b", "name": "A"})),
    row(json!({"id": "P2", "email": "c@d", "name": "C"})),
  ];
  assert!(s.upsert_bulk("people", rows.clone(), "email").await);
  assert!(s.upsert_bulk("people", rows, "email").await);
  assert_eq!(all(&s, "people").await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_grow_a_new_table_safely() {
  let s = store().await;
  let mut writers = JoinSet::new();
  for i in 0..20 {
    let s = s.clone();
    writers.spawn(async move {
      let mut r = row(json!({"id": format!("W{i:02}")}));
      r.insert(format!("c{}", i % 5), json!(i));
      s.upsert_one("wide", r, "id").await
    });
  }
  let mut ok = 0;
  while let Some(done) = writers.join_next().await {
    if done.unwrap() {
      ok += 1;
    }
  }
  assert_eq!(ok, 20);

  let stored = all(&s, "wide").await;
  assert_eq!(stored.len(), 20);
  // id, c0..c4 and the sync stamp
  assert_eq!(stored[0].len(), 7);
  assert_eq!(stored[7]["c2"], json!(7));
}

// ─── Bulk upsert ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_upsert_batches_and_is_idempotent() {
  let s = SqliteStore::open_in_memory_with(options().with_batch_size(2)).await.unwrap();
  let rows: Vec<Row> = (1..=5)
    .map(|i| row(json!({"id": format!("OU{i}"), "level": i, "name": format!("unit {i}")})))
    .collect();

  assert!(s.upsert_bulk("organisation_units", rows.clone(), "id").await);
  assert!(s.upsert_bulk("organisation_units", rows.clone(), "id").await);

  let stored = all(&s, "organisation_units").await;
  assert_eq!(stored.len(), 5);
  let stored: Vec<Row> = stored.into_iter().map(without_stamp).collect();
  assert_eq!(stored, rows);
}

#[tokio::test]
async fn bulk_upsert_uses_the_union_of_columns() {
  let s = store().await;
  let rows = vec![
    row(json!({"id": "V1", "DE1": "1"})),
    row(json!({"id": "V2", "DE2": "2"})),
  ];
  assert!(s.upsert_bulk("events", rows, "id").await);

  let stored = all(&s, "events").await;
  assert_eq!(stored[1]["DE2"], json!("2"));
  assert_eq!(stored[1]["DE1"], Value::Null);
}

#[tokio::test]
async fn bulk_upsert_with_unkeyed_rows_reports_failure_but_writes_the_rest() {
  let s = store().await;
  let rows = vec![row(json!({"id": "V1"})), row(json!({"status": "orphan"}))];
  assert!(!s.upsert_bulk("events", rows, "id").await);
  assert_eq!(all(&s, "events").await.len(), 1);
}

#[tokio::test]
async fn structural_batch_error_aborts_without_retry_and_keeps_earlier_batches() {
  let s = SqliteStore::open_in_memory_with(
    options().with_batch_size(2).with_batch_retry(RetryPolicy::fixed(5, Duration::ZERO)),
  )
  .await
  .unwrap();
  s.ensure_table("events", &row(json!({"id": "seed", "n": 0})), "id").await.unwrap();

  let attempts = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&attempts);
  s.connection()
    .call(move |conn| {
      conn.create_scalar_function("note_attempt", 0, FunctionFlags::SQLITE_UTF8, move |_| {
        Ok(counter.fetch_add(1, Ordering::SeqCst) as i64)
      })?;
      conn.execute_batch(
        "CREATE TRIGGER reject_v4 BEFORE INSERT ON events WHEN NEW.id = 'V4' BEGIN
           SELECT note_attempt();
           SELECT RAISE(ABORT, 'rejected');
         END;",
      )?;
      Ok(())
    })
    .await
    .unwrap();

  let rows: Vec<Row> = (0..6).map(|i| row(json!({"id": format!("V{i}"), "n": i}))).collect();
  assert!(!s.upsert_bulk("events", rows, "id").await);

  let ids = s.list_ids("events", Vec::new()).await.unwrap();
  assert_eq!(ids, ["V0", "V1", "V2", "V3"]);
  assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bulk_upsert_of_nothing_succeeds() {
  let s = store().await;
  assert!(s.upsert_bulk("events", Vec::new(), "id").await);
}

// ─── Deletes ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_bulk_removes_matching_rows() {
  let s = store().await;
  let rows: Vec<Row> = (1..=4).map(|i| row(json!({"id": format!("V{i}")}))).collect();
  s.upsert_bulk("events", rows, "id").await;

  let ids = vec!["V1".to_owned(), "V3".to_owned(), "V3".to_owned(), "nope".to_owned()];
  assert!(s.delete_bulk("events", "id", ids.clone()).await);
  assert!(!s.delete_bulk("events", "id", ids).await);

  let left: Vec<Value> = all(&s, "events").await.into_iter().map(|r| r["id"].clone()).collect();
  assert_eq!(left, vec![json!("V2"), json!("V4")]);
}

#[tokio::test]
async fn delete_one_reports_whether_a_row_went() {
  let s = store().await;
  s.upsert_one("events", row(json!({"id": "V1"})), "id").await;
  assert!(s.delete_one("events", "id", "V1").await);
  assert!(!s.delete_one("events", "id", "V1").await);
}

#[tokio::test]
async fn deleting_from_a_missing_table_removes_nothing() {
  let s = store().await;
  assert!(!s.delete_one("never_created", "id", "X").await);
  assert!(!s.delete_bulk("never_created", "id", vec!["X".into()]).await);
}

// ─── Sync state & reads ──────────────────────────────────────────────────────

#[tokio::test]
async fn sync_state_round_trips() {
  let s = store().await;
  assert_eq!(s.last_sync().await.unwrap(), None);

  let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
  s.record_sync(at).await.unwrap();
  assert_eq!(s.last_sync().await.unwrap(), Some(at));
}

#[tokio::test]
async fn list_ids_applies_filters() {
  let s = store().await;
  let rows = vec![
    row(json!({"id": "OU1", "level": 5})),
    row(json!({"id": "OU2", "level": 4})),
    row(json!({"id": "OU3", "level": 5})),
  ];
  s.upsert_bulk("organisation_units", rows, "id").await;

  let ids = s
    .list_ids("organisation_units", vec![("level".into(), json!(5))])
    .await
    .unwrap();
  assert_eq!(ids, vec!["OU1", "OU3"]);
  assert!(s.list_ids("missing", Vec::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn query_rows_runs_filtered_aggregates() {
  let s = store().await;
  let rows = vec![
    row(json!({"id": "1", "period": "202401", "orgunit_id": "OU1", "status": "ASC", "n": 2})),
    row(json!({"id": "2", "period": "202401", "orgunit_id": "OU1", "status": "ASC", "n": 3})),
    row(json!({"id": "3", "period": "202401", "orgunit_id": "OU1", "status": "RC", "n": 7})),
  ];
  s.upsert_bulk("facts", rows, "id").await;

  let out = s
    .query_rows(
      "SELECT period, orgunit_id, SUM(n) FILTER (WHERE status = 'ASC') AS n_asc \
       FROM facts WHERE period = ?1 AND orgunit_id = ?2 GROUP BY period, orgunit_id",
      vec![json!("202401"), json!("OU1")],
    )
    .await
    .unwrap();
  assert_eq!(out.len(), 1);
  assert_eq!(out[0]["n_asc"], json!(5));
}

// ─── View refresh ────────────────────────────────────────────────────────────

async fn seeded_for_view() -> SqliteStore {
  let s = store().await;
  let rows = vec![
    row(json!({"id": "A", "orgunit_id": "OU1", "n": 1})),
    row(json!({"id": "B", "orgunit_id": "OU2", "n": 2})),
  ];
  s.upsert_bulk("workers", rows, "id").await;
  s
}

#[tokio::test]
async fn refresh_view_rebuilds_from_select() {
  let s = seeded_for_view().await;
  let sql = "SELECT id, orgunit_id, n * 10 AS n FROM workers;";

  let out = s.refresh_view("indicators_matview", sql, "id").await.unwrap();
  assert_eq!(out, RefreshOutcome::Refreshed { rows: 2 });

  s.upsert_one("workers", row(json!({"id": "C", "orgunit_id": "OU1", "n": 3})), "id").await;
  let out = s.refresh_view("indicators_matview", sql, "id").await.unwrap();
  assert_eq!(out, RefreshOutcome::Refreshed { rows: 3 });

  let view = all(&s, "indicators_matview").await;
  assert_eq!(view[2]["n"], json!(30));
}

#[tokio::test]
async fn refresh_keeps_what_the_cache_knows_about_the_view() {
  let s = seeded_for_view().await;
  let sql = "SELECT id, n FROM workers";
  s.refresh_view("v", sql, "id").await.unwrap();
  assert!(s.table_exists("v").await.unwrap());
  let before = s.catalog_queries();

  s.refresh_view("v", sql, "id").await.unwrap();

  assert!(s.table_exists("v").await.unwrap());
  assert_eq!(s.catalog_queries(), before);
}

#[tokio::test]
async fn concurrent_refresh_is_skipped() {
  let s = seeded_for_view().await;
  let guard = s.try_begin_refresh().expect("lock is free");

  let out = s.refresh_view("v", "SELECT id FROM workers", "id").await.unwrap();
  assert_eq!(out, RefreshOutcome::Skipped);

  drop(guard);
  let out = s.refresh_view("v", "SELECT id FROM workers", "id").await.unwrap();
  assert!(matches!(out, RefreshOutcome::Refreshed { .. }));
}

#[tokio::test]
async fn failed_refresh_is_an_error_and_releases_the_lock() {
  let s = seeded_for_view().await;
  assert!(s.refresh_view("v", "SELECT nope FROM nowhere", "id").await.is_err());
  assert!(s.try_begin_refresh().is_some());
}

// ─── Files ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn file_store_persists_across_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("bridge.db");
  let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

  {
    let s = SqliteStore::open_with(&path, options()).await.unwrap();
    s.upsert_one("events", row(json!({"id": "V1"})), "id").await;
    s.record_sync(at).await.unwrap();
  }

  let s = SqliteStore::open_with(&path, options()).await.unwrap();
  assert_eq!(all(&s, "events").await.len(), 1);
  assert_eq!(s.last_sync().await.unwrap(), Some(at));
}

#[tokio::test]
async fn audit_sink_records_failures_and_deletions() {
  let dir = tempfile::tempdir().unwrap();
  let s = SqliteStore::open_in_memory_with(options().with_audit_dir(dir.path())).await.unwrap();

  s.upsert_one("events", row(json!({"status": "orphan"})), "id").await;
  s.upsert_one("events", row(json!({"id": "V1"})), "id").await;
  s.delete_bulk("events", "id", vec!["V1".into(), "V2".into()]).await;

  let failed = std::fs::read_to_string(dir.path().join("events.failed.jsonl")).unwrap();
  assert_eq!(failed.lines().count(), 1);
  let line: Value = serde_json::from_str(failed.lines().next().unwrap()).unwrap();
  assert_eq!(line["row"]["status"], json!("orphan"));

  let deleted = std::fs::read_to_string(dir.path().join("events.deleted.jsonl")).unwrap();
  assert_eq!(deleted.lines().count(), 2);
}
