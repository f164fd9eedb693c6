//! Retried GETs, pagination and bounded fan-out over the source API.

use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe};

use futures::{FutureExt as _, StreamExt as _, stream};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use trackbridge_core::{
  Error as CoreError,
  clean::strip_keys,
  entity::KindMap,
  record::{DataElement, OrgUnit},
  retry::RetryPolicy,
  transform::UNWANTED_KEYS,
  window::SyncWindow,
};

use crate::{Error, Result, Transport, TransportError, error::exhausted};

pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub const TRACKED_ENTITY_FIELDS: &str = "*,attributes[*],enrollments[*,events[*]]";

pub const ORG_UNIT_FIELDS: &str = "id,name,shortName,level,parent[id,name,shortName,level]";

pub const DATA_ELEMENT_FIELDS: &str = "id,name,code,shortName,displayFormName,displayName,\
  dataElementGroups,dimensionItemType,aggregationType,domainType,valueType,zeroIsSignificant,\
  categoryCombo,optionSetValue,optionSet,dataSetElements,aggregationLevels,created";

/// Parameters owned by [`RemoteFetcher::paginate`]; caller values are replaced.
const PAGING_PARAMS: &[&str] = &["paging", "pageSize", "page"];

pub(crate) fn pair(key: &str, value: impl ToString) -> (String, String) {
  (key.to_owned(), value.to_string())
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// A paginated collection: the path to GET and the response key holding the
/// items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub path:     String,
  pub data_key: String,
}

impl Endpoint {
  /// The data key is `path` without a trailing `.json`.
  pub fn new(path: impl Into<String>) -> Self {
    let path = path.into();
    let data_key = path.strip_suffix(".json").unwrap_or(&path).to_owned();
    Self { path, data_key }
  }

  pub fn with_key(path: impl Into<String>, data_key: impl Into<String>) -> Self {
    Self { path: path.into(), data_key: data_key.into() }
  }
}

impl From<&str> for Endpoint {
  fn from(path: &str) -> Self { Self::new(path) }
}

impl From<(&str, &str)> for Endpoint {
  fn from((path, data_key): (&str, &str)) -> Self { Self::with_key(path, data_key) }
}

// ─── RemoteFetcher ───────────────────────────────────────────────────────────

pub struct RemoteFetcher<T> {
  transport: T,
  retry:     RetryPolicy,
  page_size: u32,
}

impl<T: Transport> RemoteFetcher<T> {
  pub fn new(transport: T) -> Self {
    Self { transport, retry: RetryPolicy::default(), page_size: DEFAULT_PAGE_SIZE }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn transport(&self) -> &T { &self.transport }

  pub fn page_size(&self) -> u32 { self.page_size }

  // ── Primitives ────────────────────────────────────────────────────────

  /// One GET, retried on any transport failure with the configured delay.
  pub async fn get(&self, endpoint: &str, query: &[(String, String)]) -> Result<Value> {
    self
      .retry
      .run(endpoint, || self.transport.get(endpoint, query), |_: &TransportError| true)
      .await
      .map_err(|e| {
        let (attempts, source) = exhausted(e);
        error!(endpoint, attempts, error = %source, "remote GET failed");
        Error::FetchFailed { endpoint: endpoint.to_owned(), attempts, source }
      })
  }

  /// Follow `pager` until the last page, accumulating the endpoint's items.
  ///
  /// A response without a pager is treated as the only page. `keys_to_remove`
  /// are stripped at every nesting level of every item.
  pub async fn paginate(
    &self,
    endpoint: impl Into<Endpoint>,
    query: &[(String, String)],
    keys_to_remove: &[&str],
  ) -> Result<Vec<Value>> {
    let endpoint = endpoint.into();
    let mut params: Vec<(String, String)> = query
      .iter()
      .filter(|(k, _)| !PAGING_PARAMS.contains(&k.as_str()))
      .cloned()
      .collect();
    params.push(pair("paging", "true"));
    params.push(pair("pageSize", self.page_size));
    let page_slot = params.len();
    params.push(pair("page", 1));

    let mut items = Vec::new();
    let mut page: u64 = 1;
    loop {
      params[page_slot].1 = page.to_string();
      let mut body = self.get(&endpoint.path, &params).await?;

      match body.get_mut(endpoint.data_key.as_str()).map(Value::take) {
        Some(Value::Array(batch)) => items.extend(batch),
        None | Some(Value::Null) => {}
        Some(_) => {
          return Err(Error::UnexpectedShape {
            endpoint: endpoint.path.clone(),
            detail:   format!("`{}` is not a list", endpoint.data_key),
          });
        }
      }

      let pager = body.get("pager");
      let Some(page_count) = pager.and_then(|p| p.get("pageCount")).and_then(Value::as_u64)
      else {
        break;
      };
      let reported = pager.and_then(|p| p.get("page")).and_then(Value::as_u64).unwrap_or(page);
      let current = reported.max(page);
      if current >= page_count {
        break;
      }
      page = current + 1;
      debug!(endpoint = %endpoint.path, page, page_count, so_far = items.len(), "next page");
    }

    if !keys_to_remove.is_empty() {
      for item in &mut items {
        strip_keys(item, keys_to_remove);
      }
    }
    Ok(items)
  }

  // ── Source collections ────────────────────────────────────────────────

  /// Tracked entities of `program` under `orgunit` updated inside `window`,
  /// with enrollments, events and attributes inlined.
  pub async fn fetch_tracked_entities(
    &self,
    program: &str,
    orgunit: &str,
    window: &SyncWindow,
  ) -> Result<Vec<Value>> {
    if program.trim().is_empty() {
      return Err(CoreError::MissingField("program").into());
    }
    if orgunit.trim().is_empty() {
      return Err(CoreError::MissingField("orgunit").into());
    }

    let query = [
      pair("program", program),
      pair("ou", orgunit),
      pair("fields", TRACKED_ENTITY_FIELDS),
      pair("lastUpdatedStartDate", &window.start),
      pair("lastUpdatedEndDate", &window.end),
    ];
    let teis = self.paginate("trackedEntityInstances", &query, UNWANTED_KEYS).await?;
    debug!(orgunit, count = teis.len(), "fetched tracked entities");
    Ok(teis)
  }

  /// Organisation units, optionally only those at `level`, sorted by level.
  pub async fn fetch_organisation_units(&self, level: Option<u32>) -> Result<Vec<OrgUnit>> {
    let mut query = vec![pair("fields", ORG_UNIT_FIELDS)];
    if let Some(level) = level {
      query.push(pair("filter", format!("level:eq:{level}")));
    }
    let raw = self.paginate("organisationUnits", &query, &[]).await?;
    let mut units: Vec<OrgUnit> = decode_all("organisationUnits", flatten_nested(raw));
    units.sort_by_key(|u| u.level.unwrap_or(0));
    info!(count = units.len(), ?level, "fetched organisation units");
    Ok(units)
  }

  pub async fn fetch_data_elements(&self) -> Result<Vec<DataElement>> {
    let query = [pair("fields", DATA_ELEMENT_FIELDS)];
    let raw = self.paginate("dataElements", &query, &[]).await?;
    let elements: Vec<DataElement> = decode_all("dataElements", flatten_nested(raw));
    info!(count = elements.len(), "fetched data elements");
    Ok(elements)
  }
}

/// Inline items that arrive wrapped in an inner list.
fn flatten_nested(items: Vec<Value>) -> Vec<Value> {
  items
    .into_iter()
    .flat_map(|item| match item {
      Value::Array(inner) => inner,
      other => vec![other],
    })
    .collect()
}

fn decode_all<R: serde::de::DeserializeOwned>(endpoint: &str, items: Vec<Value>) -> Vec<R> {
  items
    .into_iter()
    .filter_map(|item| match serde_json::from_value(item) {
      Ok(record) => Some(record),
      Err(e) => {
        warn!(endpoint, error = %e, "skipping malformed item");
        None
      }
    })
    .collect()
}

// ─── Fan-out ─────────────────────────────────────────────────────────────────

/// Run `worker` for every target with at most `max_concurrency` in flight
/// and merge what they return.
///
/// A target whose worker errors or panics is logged and contributes nothing.
/// Items keep their order within a target; targets complete in any order.
pub async fn fan_out<I, W, Fut, U, E>(targets: I, worker: W, max_concurrency: usize) -> KindMap<U>
where
  I: IntoIterator,
  I::Item: fmt::Display,
  W: Fn(I::Item) -> Fut,
  Fut: Future<Output = Result<KindMap<U>, E>>,
  E: fmt::Display,
{
  let worker = &worker;
  let outcomes: Vec<Option<KindMap<U>>> = stream::iter(targets)
    .map(|target| async move {
      let label = target.to_string();
      match AssertUnwindSafe(worker(target)).catch_unwind().await {
        Ok(Ok(map)) => Some(map),
        Ok(Err(e)) => {
          error!(target = %label, error = %e, "target failed");
          None
        }
        Err(panic) => {
          error!(target = %label, panic = panic_message(panic.as_ref()), "target panicked");
          None
        }
      }
    })
    .buffer_unordered(max_concurrency.max(1))
    .collect()
    .await;

  let total = outcomes.len();
  let mut merged = KindMap::new();
  let mut failed = 0usize;
  for outcome in outcomes {
    match outcome {
      Some(map) => merged.merge(map),
      None => failed += 1,
    }
  }
  info!(targets = total, failed, "fan-out finished");
  merged
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
  payload
    .downcast_ref::<&str>()
    .copied()
    .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
    .unwrap_or("non-string panic payload")
}
