//! Delivery of aggregate data value sets to the destination instance.

use futures::{StreamExt as _, stream};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use trackbridge_core::{
  indicator::DataValueSet,
  retry::RetryPolicy,
};

use crate::{Error, Result, Transport, TransportError, error::exhausted, fetcher::pair};

pub const DATA_VALUE_SETS: &str = "dataValueSets";

/// Whether the destination already held values for the payload's key.
/// Informational only: the payload is posted either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendStatus {
  Created,
  Updated,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendResult {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status:  Option<SendStatus>,
  pub payload: DataValueSet,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error:   Option<String>,
}

impl SendResult {
  /// True when every result in `results` succeeded.
  pub fn all_succeeded(results: &[SendResult]) -> bool { results.iter().all(|r| r.success) }
}

pub struct DestinationSender<T> {
  transport: T,
  retry:     RetryPolicy,
}

impl<T: Transport> DestinationSender<T> {
  pub fn new(transport: T) -> Self { Self { transport, retry: RetryPolicy::default() } }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn transport(&self) -> &T { &self.transport }

  /// Send every payload with at most `max_concurrency` in flight. One
  /// result per payload, in completion order.
  pub async fn send(&self, payloads: Vec<DataValueSet>, max_concurrency: usize) -> Vec<SendResult> {
    let total = payloads.len();
    let results: Vec<SendResult> = stream::iter(payloads)
      .map(|payload| self.send_one(payload))
      .buffer_unordered(max_concurrency.max(1))
      .collect()
      .await;

    let failed = results.iter().filter(|r| !r.success).count();
    info!(total, failed, "data value sets sent");
    results
  }

  async fn send_one(&self, payload: DataValueSet) -> SendResult {
    match self.push(&payload).await {
      Ok(status) => {
        debug!(period = %payload.period, org_unit = %payload.org_unit, ?status, "sent");
        SendResult { success: true, status: Some(status), payload, error: None }
      }
      Err(e) => {
        warn!(period = %payload.period, org_unit = %payload.org_unit, error = %e, "send failed");
        SendResult { success: false, status: None, payload, error: Some(e.to_string()) }
      }
    }
  }

  async fn push(&self, payload: &DataValueSet) -> Result<SendStatus> {
    let query = [
      pair("dataSet", &payload.data_set),
      pair("period", &payload.period),
      pair("orgUnit", &payload.org_unit),
    ];
    let existing = self
      .retry
      .run(DATA_VALUE_SETS, || self.transport.get(DATA_VALUE_SETS, &query), |_: &TransportError| true)
      .await
      .map_err(|e| {
        let (attempts, source) = exhausted(e);
        Error::FetchFailed { endpoint: DATA_VALUE_SETS.to_owned(), attempts, source }
      })?;

    let status = if has_values(&existing) { SendStatus::Updated } else { SendStatus::Created };

    let body = serde_json::to_value(payload)?;
    self
      .retry
      .run(DATA_VALUE_SETS, || self.transport.post(DATA_VALUE_SETS, &body), |_: &TransportError| true)
      .await
      .map_err(|e| {
        let (attempts, source) = exhausted(e);
        Error::SendFailed { endpoint: DATA_VALUE_SETS.to_owned(), attempts, source }
      })?;
    Ok(status)
  }
}

fn has_values(existing: &Value) -> bool {
  existing.get("dataValues").and_then(Value::as_array).is_some_and(|v| !v.is_empty())
}
