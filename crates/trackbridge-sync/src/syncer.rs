//! The [`Syncer`]: tracker sync, reference sync and the aggregate run.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};
use trackbridge_core::{
  entity::{EntityKind, KindFlags, KindMap, Row},
  indicator::{
    IndicatorGroup, IndicatorMap, build_payloads, build_query, completion_date, default_groups,
  },
  period::{Month, previous_month},
  store::RecordStore,
  transform::flatten,
  window::{Moment, SyncWindow, resolve},
};
use trackbridge_remote::{DestinationSender, RemoteFetcher, SendResult, Transport, fan_out};
use trackbridge_store_sqlite::{RefreshOutcome, SqliteStore};

use crate::{Error, Result};

pub const NO_DATA: &str = "No data to send";
pub const MAP_LOAD_FAILED: &str = "Indicators map load failed";
pub const SENT: &str = "Successfully sent to destination";
pub const TRANSFORMED: &str = "Success transformed";

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Tracker program whose records are synced.
  pub program:            String,
  /// Level of the stored organisation units a sync fans out over when no
  /// unit is named.
  pub orgunit_level:      Option<u32>,
  pub max_workers:        usize,
  pub dataset_id:         String,
  pub indicator_map_path: PathBuf,
  pub groups:             Vec<IndicatorGroup>,
  /// Table the aggregation queries read from.
  pub view_name:          String,
  /// Post payloads to the destination; otherwise only build them.
  pub send_to_remote:     bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      program:            String::new(),
      orgunit_level:      Some(5),
      max_workers:        10,
      dataset_id:         "mxX2xHChatk".into(),
      indicator_map_path: "helpers/indicators_map.json".into(),
      groups:             default_groups(),
      view_name:          "indicators_matview".into(),
      send_to_remote:     true,
    }
  }
}

// ─── Reports ─────────────────────────────────────────────────────────────────

/// What one organisation unit's worker did to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
  Written(String),
  Deleted(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
  pub written: usize,
  pub deleted: usize,
}

/// Per-kind totals of a tracker sync, whether or not each row persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub window:   SyncWindow,
  pub orgunits: usize,
  pub kinds:    BTreeMap<EntityKind, KindCounts>,
}

impl SyncReport {
  pub fn written(&self, kind: EntityKind) -> usize {
    self.kinds.get(&kind).map_or(0, |c| c.written)
  }

  pub fn deleted(&self, kind: EntityKind) -> usize {
    self.kinds.get(&kind).map_or(0, |c| c.deleted)
  }
}

/// Combined result of every aggregate run that ended with `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateOutcome {
  pub message: String,
  /// Payloads built.
  pub size:    usize,
  /// False when any contributing run failed.
  pub status:  bool,
}

// ─── Syncer ──────────────────────────────────────────────────────────────────

/// Owns one store and the two remote ends. `T` reads the source instance,
/// `D` writes to the destination.
pub struct Syncer<S, T, D = T> {
  store:   Arc<S>,
  fetcher: RemoteFetcher<T>,
  sender:  DestinationSender<D>,
  options: SyncOptions,
}

impl<S, T, D> Syncer<S, T, D>
where
  S: RecordStore,
  T: Transport,
  D: Transport,
{
  pub fn new(
    store: Arc<S>,
    fetcher: RemoteFetcher<T>,
    sender: DestinationSender<D>,
    options: SyncOptions,
  ) -> Self {
    Self { store, fetcher, sender, options }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn options(&self) -> &SyncOptions { &self.options }

  // ── Tracker sync ──────────────────────────────────────────────────────

  /// Pull tracker records updated inside the window, flatten them and
  /// persist the kinds enabled in `flags`.
  ///
  /// `start`/`end` override the stored watermark. Only a run with every
  /// kind enabled advances the watermark, to the time the run started.
  pub async fn sync_tracker(
    &self,
    orgunit: Option<&str>,
    flags: KindFlags,
    start: Option<Moment>,
    end: Option<Moment>,
  ) -> Result<SyncReport> {
    let started = Utc::now();
    let last_sync = self.store.last_sync().await.map_err(Error::store)?;
    let window = resolve(start, end, last_sync.map(Moment::from), Moment::from(started));

    let orgunits = match orgunit {
      Some(ou) => vec![ou.to_owned()],
      None => self.stored_orgunits(self.options.orgunit_level).await?,
    };
    info!(
      orgunits = orgunits.len(),
      start = %window.start,
      end = %window.end,
      ?flags,
      "tracker sync started"
    );

    let changes = fan_out(
      orgunits.iter().map(String::as_str),
      |ou| self.sync_orgunit(ou, flags, &window),
      self.options.max_workers,
    )
    .await;

    if flags.is_full() {
      self.store.record_sync(started).await.map_err(Error::store)?;
    }

    let report = SyncReport { window, orgunits: orgunits.len(), kinds: tally(&changes) };
    info!(kinds = ?report.kinds, "tracker sync finished");
    Ok(report)
  }

  /// One organisation unit: fetch, flatten, upsert, then delete.
  async fn sync_orgunit(
    &self,
    orgunit: &str,
    flags: KindFlags,
    window: &SyncWindow,
  ) -> Result<KindMap<Change>> {
    let raw = self.fetcher.fetch_tracked_entities(&self.options.program, orgunit, window).await?;
    let flat = flatten(&raw, &self.options.program, flags);

    let mut changes = KindMap::new();
    for kind in EntityKind::TRACKER {
      let rows = flat.writable(kind);
      let ids: Vec<String> = rows.iter().filter_map(|r| key_text(r, kind.key_column())).collect();
      if !rows.is_empty() && !self.store.upsert_bulk(kind.table(), rows, kind.key_column()).await {
        warn!(orgunit, %kind, "some rows were not written");
      }
      changes.extend(kind, ids.into_iter().map(Change::Written));
    }

    for kind in EntityKind::TRACKER {
      let ids = flat.deletes.get(kind).to_vec();
      if ids.is_empty() {
        continue;
      }
      self.store.delete_bulk(kind.table(), kind.key_column(), ids.clone()).await;
      changes.extend(kind, ids.into_iter().map(Change::Deleted));
    }
    Ok(changes)
  }

  async fn stored_orgunits(&self, level: Option<u32>) -> Result<Vec<String>> {
    let filters = level.map(|l| vec![("level".to_owned(), json!(l))]).unwrap_or_default();
    self
      .store
      .list_ids(EntityKind::OrgUnit.table(), filters)
      .await
      .map_err(Error::store)
  }

  // ── Reference data ────────────────────────────────────────────────────

  /// Fetch one reference collection and upsert it. Returns the number of
  /// records fetched.
  pub async fn fetch_reference(&self, kind: EntityKind) -> Result<usize> {
    let rows: Vec<Row> = match kind {
      EntityKind::OrgUnit => self
        .fetcher
        .fetch_organisation_units(self.options.orgunit_level)
        .await?
        .into_iter()
        .map(|u| u.into_row())
        .collect::<Result<_, _>>()?,
      EntityKind::DataElement => self
        .fetcher
        .fetch_data_elements()
        .await?
        .into_iter()
        .map(|d| d.into_row())
        .collect::<Result<_, _>>()?,
      other => return Err(Error::NotReference(other)),
    };

    let count = rows.len();
    if count > 0 && !self.store.upsert_bulk(kind.table(), rows, kind.key_column()).await {
      warn!(%kind, "some reference rows were not written");
    }
    info!(%kind, count, "reference data synced");
    Ok(count)
  }

  // ── Aggregation ───────────────────────────────────────────────────────

  /// Build and send indicator payloads.
  ///
  /// With both `periods` and `orgunits` non-empty, one run per (orgunit,
  /// period) pair; otherwise a single unfiltered run. Outcomes sharing a
  /// message are merged.
  pub async fn aggregate(
    &self,
    periods: &[String],
    orgunits: &[String],
  ) -> Result<Vec<AggregateOutcome>> {
    let periods = periods
      .iter()
      .map(|p| Month::parse(p).map(|m| m.to_string()))
      .collect::<Result<Vec<_>, _>>()?;

    let map = match IndicatorMap::load(&self.options.indicator_map_path) {
      Ok(map) => map,
      Err(e) => {
        error!(path = ?self.options.indicator_map_path, error = %e, "indicator map not loaded");
        return Ok(vec![AggregateOutcome {
          message: MAP_LOAD_FAILED.into(),
          size:    0,
          status:  false,
        }]);
      }
    };

    let mut outcomes: Vec<AggregateOutcome> = Vec::new();
    if !periods.is_empty() && !orgunits.is_empty() {
      for orgunit in orgunits {
        for period in &periods {
          let run = self.aggregate_once(&map, Some((period.as_str(), orgunit.as_str()))).await?;
          merge_outcome(&mut outcomes, run);
        }
      }
    } else {
      let run = self.aggregate_once(&map, None).await?;
      merge_outcome(&mut outcomes, run);
    }

    for o in &outcomes {
      info!(message = %o.message, size = o.size, status = o.status, "aggregate finished");
    }
    Ok(outcomes)
  }

  /// Aggregate last month for every stored organisation unit.
  pub async fn aggregate_previous_month(&self, today: NaiveDate) -> Result<Vec<AggregateOutcome>> {
    let period = previous_month(today);
    let orgunits = self.stored_orgunits(None).await?;
    info!(%period, orgunits = orgunits.len(), "aggregating previous month");
    self.aggregate(&[period], &orgunits).await
  }

  async fn aggregate_once(
    &self,
    map: &IndicatorMap,
    filter: Option<(&str, &str)>,
  ) -> Result<AggregateOutcome> {
    let params: Vec<Value> =
      filter.map(|(period, ou)| vec![json!(period), json!(ou)]).unwrap_or_default();

    let mut rows = Vec::new();
    for group in &self.options.groups {
      let sql = build_query(group, &self.options.view_name, filter.is_some())?;
      rows.extend(self.store.query_rows(&sql, params.clone()).await.map_err(Error::store)?);
    }

    let completed = completion_date(Utc::now().naive_utc());
    let payloads = build_payloads(&rows, map, &self.options.dataset_id, &completed);
    let size = payloads.len();
    if size == 0 {
      return Ok(AggregateOutcome { message: NO_DATA.into(), size: 0, status: true });
    }
    if !self.options.send_to_remote {
      return Ok(AggregateOutcome { message: TRANSFORMED.into(), size, status: true });
    }

    let results = self.sender.send(payloads, self.options.max_workers).await;
    Ok(AggregateOutcome {
      message: SENT.into(),
      size,
      status: SendResult::all_succeeded(&results),
    })
  }
}

impl<T, D> Syncer<SqliteStore, T, D>
where
  T: Transport,
  D: Transport,
{
  /// Rebuild the indicator view from `select_sql`, keyed on `key_column`.
  pub async fn refresh_view(&self, select_sql: &str, key_column: &str) -> Result<RefreshOutcome> {
    self
      .store
      .refresh_view(&self.options.view_name, select_sql, key_column)
      .await
      .map_err(Error::store)
  }
}

fn key_text(row: &Row, key: &str) -> Option<String> {
  match row.get(key)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn tally(changes: &KindMap<Change>) -> BTreeMap<EntityKind, KindCounts> {
  EntityKind::TRACKER
    .into_iter()
    .map(|kind| {
      let mut counts = KindCounts::default();
      for change in changes.get(kind) {
        match change {
          Change::Written(_) => counts.written += 1,
          Change::Deleted(_) => counts.deleted += 1,
        }
      }
      (kind, counts)
    })
    .collect()
}

fn merge_outcome(outcomes: &mut Vec<AggregateOutcome>, run: AggregateOutcome) {
  match outcomes.iter_mut().find(|o| o.message == run.message) {
    Some(existing) => {
      existing.size += run.size;
      existing.status &= run.status;
    }
    None => outcomes.push(run),
  }
}
