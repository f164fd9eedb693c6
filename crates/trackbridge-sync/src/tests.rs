//! `Syncer` tests against an in-memory store and fake remote instances.

use std::{
  collections::HashMap,
  path::Path,
  sync::{Arc, Mutex},
};

use chrono::NaiveDate;
use serde_json::{Value, json};
use trackbridge_core::{
  entity::{EntityKind, KindFlags, Row},
  indicator::default_groups,
  retry::RetryPolicy,
  store::RecordStore,
  window::Moment,
};
use trackbridge_remote::{DestinationSender, Query, RemoteFetcher, Transport, TransportError};
use trackbridge_store_sqlite::{RefreshOutcome, SqliteStore, StoreOptions};

use crate::{
  AggregateOutcome, Error, SyncOptions, Syncer,
  syncer::{MAP_LOAD_FAILED, NO_DATA, SENT, TRANSFORMED},
};

// ─── Fakes ───────────────────────────────────────────────────────────────────

/// Source instance: tracked entities per org unit plus reference lists.
#[derive(Default)]
struct Source {
  teis:     HashMap<String, Value>,
  failing:  Vec<String>,
  orgunits: Vec<Value>,
}

impl Source {
  fn with(mut self, orgunit: &str, teis: Value) -> Self {
    self.teis.insert(orgunit.to_owned(), teis);
    self
  }
}

fn param<'q>(query: &'q Query, key: &str) -> Option<&'q str> {
  query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

impl Transport for Source {
  async fn get<'a>(&'a self, path: &'a str, query: &'a Query) -> Result<Value, TransportError> {
    let pager = json!({"page": 1, "pageCount": 1});
    match path {
      "trackedEntityInstances" => {
        let ou = param(query, "ou").unwrap_or_default();
        if self.failing.iter().any(|f| f == ou) {
          return Err(TransportError::Status { status: 500, body: "boom".into() });
        }
        let teis = self.teis.get(ou).cloned().unwrap_or_else(|| json!([]));
        Ok(json!({"trackedEntityInstances": teis, "pager": pager}))
      }
      "organisationUnits" => Ok(json!({"organisationUnits": self.orgunits, "pager": pager})),
      "dataElements" => Ok(json!({
        "dataElements": [
          {"id": "DE1", "name": "Proposals", "valueType": "INTEGER_ZERO_OR_POSITIVE"},
          {"id": "DE2", "name": "Visits", "zeroIsSignificant": false}
        ]
      })),
      other => Err(TransportError::Status { status: 404, body: other.to_owned() }),
    }
  }

  async fn post<'a>(&'a self, _path: &'a str, _body: &'a Value) -> Result<Value, TransportError> {
    Err(TransportError::Status { status: 405, body: "read-only".into() })
  }
}

/// Destination instance that accepts everything and keeps the bodies.
#[derive(Default)]
struct Destination {
  posted: Mutex<Vec<Value>>,
}

impl Transport for Destination {
  async fn get<'a>(&'a self, _path: &'a str, _query: &'a Query) -> Result<Value, TransportError> {
    Ok(json!({}))
  }

  async fn post<'a>(&'a self, _path: &'a str, body: &'a Value) -> Result<Value, TransportError> {
    self.posted.lock().unwrap().push(body.clone());
    Ok(json!({"status": "SUCCESS"}))
  }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

type TestSyncer = Syncer<SqliteStore, Source, Destination>;

async fn store() -> Arc<SqliteStore> {
  let options = StoreOptions::default()
    .with_row_retry(RetryPolicy::none())
    .with_batch_retry(RetryPolicy::none());
  Arc::new(SqliteStore::open_in_memory_with(options).await.unwrap())
}

fn options() -> SyncOptions {
  SyncOptions { program: "P1".into(), max_workers: 2, ..SyncOptions::default() }
}

fn syncer(store: Arc<SqliteStore>, source: Source, options: SyncOptions) -> TestSyncer {
  Syncer::new(
    store,
    RemoteFetcher::new(source).with_retry(RetryPolicy::none()),
    DestinationSender::new(Destination::default()).with_retry(RetryPolicy::none()),
    options,
  )
}

fn tei(id: &str, orgunit: &str, deleted: bool) -> Value {
  json!({
    "trackedEntityInstance": id,
    "orgUnit": orgunit,
    "trackedEntityType": "person",
    "deleted": deleted,
    "enrollments": [{
      "enrollment": format!("{id}-enr"),
      "orgUnit": orgunit,
      "status": "ACTIVE",
      "attributes": [{"attribute": "sex", "value": "F"}],
      "events": [{
        "event": format!("{id}-ev"),
        "orgUnit": orgunit,
        "status": "COMPLETED",
        "dataValues": [{"dataElement": "DE1", "value": "5"}]
      }]
    }]
  })
}

fn window_start() -> Option<Moment> { Some(Moment::parse("2024-01-01").unwrap()) }

async fn rows(store: &SqliteStore, kind: EntityKind) -> Vec<Row> {
  store.list_rows(kind.table(), &[], Some("id")).await.unwrap()
}

// ─── Tracker sync ────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_sync_persists_every_kind_and_advances_the_watermark() {
  let store = store().await;
  let source = Source::default().with("OU1", json!([tei("T1", "OU1", false)]));
  let s = syncer(store.clone(), source, options());

  let report = s.sync_tracker(Some("OU1"), KindFlags::all(), None, None).await.unwrap();

  for kind in EntityKind::TRACKER {
    assert_eq!(report.written(kind), 1, "{kind}");
    assert_eq!(report.deleted(kind), 0, "{kind}");
  }
  assert_eq!(report.window.start, "2022-01-01T00:00:00.000");

  let events = rows(&store, EntityKind::Event).await;
  assert_eq!(events.len(), 1);
  assert_eq!(events[0]["DE1"], json!("5"));
  assert_eq!(rows(&store, EntityKind::Attribute).await[0]["id"], json!("T1-T1-enr"));

  assert!(store.last_sync().await.unwrap().is_some());
}

#[tokio::test]
async fn partial_sync_leaves_the_watermark_alone() {
  let store = store().await;
  let source = Source::default().with("OU1", json!([tei("T1", "OU1", false)]));
  let s = syncer(store.clone(), source, options());

  let flags = KindFlags { events: true, ..KindFlags::none() };
  let report = s.sync_tracker(Some("OU1"), flags, None, None).await.unwrap();

  assert_eq!(report.written(EntityKind::Event), 1);
  assert_eq!(report.written(EntityKind::TrackedEntity), 0);
  assert!(!store.table_exists("tracked_entity_instances").await.unwrap());
  assert!(store.last_sync().await.unwrap().is_none());
}

#[tokio::test]
async fn deleted_tracked_entity_cascades_on_the_next_sync() {
  let store = store().await;
  let live = Source::default().with("OU1", json!([tei("T1", "OU1", false)]));
  syncer(store.clone(), live, options())
    .sync_tracker(Some("OU1"), KindFlags::all(), window_start(), None)
    .await
    .unwrap();

  let gone = Source::default().with("OU1", json!([tei("T1", "OU1", true)]));
  let report = syncer(store.clone(), gone, options())
    .sync_tracker(Some("OU1"), KindFlags::all(), window_start(), None)
    .await
    .unwrap();

  for kind in EntityKind::TRACKER {
    assert_eq!(report.written(kind), 0, "{kind}");
    assert_eq!(report.deleted(kind), 1, "{kind}");
    assert!(rows(&store, kind).await.is_empty(), "{kind}");
  }
}

#[tokio::test]
async fn explicit_window_overrides_the_watermark() {
  let store = store().await;
  let s = syncer(store.clone(), Source::default(), options());
  let end = Some(Moment::parse("2024-01-31").unwrap());

  let report = s.sync_tracker(Some("OU1"), KindFlags::all(), window_start(), end).await.unwrap();

  assert_eq!(report.window.start, "2024-01-01T00:00:00.000");
  assert_eq!(report.window.end, "2024-01-31T23:59:00.000");
}

#[tokio::test]
async fn sync_fans_out_over_stored_units_and_tolerates_failures() {
  let store = store().await;
  let source = Source {
    orgunits: vec![
      json!({"id": "OU0", "level": 4}),
      json!({"id": "OU1", "level": 5}),
      json!({"id": "OU2", "level": 5}),
      json!({"id": "OU3", "level": 5}),
    ],
    failing: vec!["OU3".into()],
    ..Source::default()
  }
  .with("OU1", json!([tei("T1", "OU1", false)]))
  .with("OU2", json!([tei("T2", "OU2", false)]))
  .with("OU0", json!([tei("T0", "OU0", false)]));
  let s = syncer(store.clone(), source, options());

  assert_eq!(s.fetch_reference(EntityKind::OrgUnit).await.unwrap(), 4);
  let report = s.sync_tracker(None, KindFlags::all(), None, None).await.unwrap();

  assert_eq!(report.orgunits, 3);
  assert_eq!(report.written(EntityKind::TrackedEntity), 2);
  let ids = store.list_ids("tracked_entity_instances", vec![]).await.unwrap();
  assert_eq!(ids, ["T1", "T2"]);
}

// ─── Reference data ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reference_data_lands_in_snake_case_columns() {
  let store = store().await;
  let s = syncer(store.clone(), Source::default(), options());

  assert_eq!(s.fetch_reference(EntityKind::DataElement).await.unwrap(), 2);
  let elements = rows(&store, EntityKind::DataElement).await;
  assert_eq!(elements.len(), 2);
  assert_eq!(elements[0]["value_type"], json!("INTEGER_ZERO_OR_POSITIVE"));
}

#[tokio::test]
async fn tracker_kinds_are_not_reference_data() {
  let s = syncer(store().await, Source::default(), options());
  assert!(matches!(
    s.fetch_reference(EntityKind::Event).await,
    Err(Error::NotReference(EntityKind::Event))
  ));
}

// ─── Aggregation ─────────────────────────────────────────────────────────────

const VIEW_SQL: &str = "
  SELECT 'R1' AS uid, '202401' AS period, 'OU1' AS orgunit_id, 'ASC' AS status,
         0 AS proposition_faite, 5 AS proposition_valide
  UNION ALL
  SELECT 'R2', '202401', 'OU2', 'RC', 2, 3
";

fn write_map(dir: &Path) -> std::path::PathBuf {
  let path = dir.join("indicators_map.json");
  std::fs::write(
    &path,
    json!({"proposition_valide_asc": {"de": "DE_PV", "combo": "COC_ASC"}}).to_string(),
  )
  .unwrap();
  path
}

async fn aggregating(dir: &Path, send: bool) -> TestSyncer {
  let options = SyncOptions {
    indicator_map_path: write_map(dir),
    groups: default_groups().into_iter().take(1).collect(),
    send_to_remote: send,
    ..options()
  };
  let s = syncer(store().await, Source::default(), options);
  let outcome = s.refresh_view(VIEW_SQL, "uid").await.unwrap();
  assert_eq!(outcome, RefreshOutcome::Refreshed { rows: 2 });
  s
}

fn outcome(message: &str, size: usize, status: bool) -> AggregateOutcome {
  AggregateOutcome { message: message.into(), size, status }
}

#[tokio::test]
async fn unfiltered_run_sends_only_mapped_positive_values() {
  let dir = tempfile::tempdir().unwrap();
  let s = aggregating(dir.path(), true).await;

  let outcomes = s.aggregate(&[], &[]).await.unwrap();

  assert_eq!(outcomes, [outcome(SENT, 1, true)]);
}

#[tokio::test]
async fn per_pair_runs_are_merged_by_message() {
  let dir = tempfile::tempdir().unwrap();
  let s = aggregating(dir.path(), true).await;

  let outcomes = s
    .aggregate(&["2024-01".to_owned()], &["OU1".to_owned(), "OU2".to_owned(), "OU9".to_owned()])
    .await
    .unwrap();

  assert_eq!(outcomes, [outcome(SENT, 1, true), outcome(NO_DATA, 0, true)]);
}

#[tokio::test]
async fn transform_only_run_does_not_send() {
  let dir = tempfile::tempdir().unwrap();
  let s = aggregating(dir.path(), false).await;

  let outcomes = s.aggregate(&[], &[]).await.unwrap();
  assert_eq!(outcomes, [outcome(TRANSFORMED, 1, true)]);
}

#[tokio::test]
async fn missing_indicator_map_fails_the_run() {
  let dir = tempfile::tempdir().unwrap();
  let options = SyncOptions { indicator_map_path: dir.path().join("absent.json"), ..options() };
  let s = syncer(store().await, Source::default(), options);

  let outcomes = s.aggregate(&[], &[]).await.unwrap();
  assert_eq!(outcomes, [outcome(MAP_LOAD_FAILED, 0, false)]);
}

#[tokio::test]
async fn malformed_period_is_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let s = aggregating(dir.path(), true).await;
  let err = s.aggregate(&["someday".to_owned()], &["OU1".to_owned()]).await.unwrap_err();
  assert!(matches!(err, Error::Core(trackbridge_core::Error::InvalidPeriod(_))), "{err}");
}

#[tokio::test]
async fn previous_month_covers_every_stored_unit() {
  let dir = tempfile::tempdir().unwrap();
  let s = aggregating(dir.path(), true).await;
  let units: Vec<Row> = vec![
    [("id".to_owned(), json!("OU1"))].into_iter().collect(),
    [("id".to_owned(), json!("OU2"))].into_iter().collect(),
  ];
  assert!(s.store().upsert_bulk("organisation_units", units, "id").await);

  let today = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
  let outcomes = s.aggregate_previous_month(today).await.unwrap();

  assert_eq!(outcomes, [outcome(SENT, 1, true), outcome(NO_DATA, 0, true)]);
}
