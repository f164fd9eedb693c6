//! Incremental sync-window resolution.
//!
//! Pure: given the caller's optional bounds, the last recorded watermark and
//! the current time, compute the `lastUpdated` range to request.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::Serialize;

use crate::{Error, Result};

/// Watermark used when no successful sync has ever been recorded.
pub const DEFAULT_EPOCH: &str = "2022-01-01T00:00:00";

/// Output format: ISO 8601 with millisecond precision, no offset.
pub const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

const DATETIME_FORMATS: &[&str] = &[
  "%Y-%m-%dT%H:%M:%S%.f",
  "%Y-%m-%d %H:%M:%S%.f",
  "%Y-%m-%dT%H:%M",
];

// ─── Moment ──────────────────────────────────────────────────────────────────

/// A bound as supplied by a caller: either a bare calendar date or a full
/// date-time. Only bare dates are normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moment {
  Date(NaiveDate),
  DateTime(NaiveDateTime),
}

impl Moment {
  /// Parse `YYYY-MM-DD` or an ISO 8601 date-time (a trailing `Z` or an
  /// explicit offset is accepted and converted to UTC).
  pub fn parse(input: &str) -> Result<Self> {
    let s = input.trim();
    let invalid = || Error::InvalidDate(input.to_owned());

    if !s.contains('T') && !s.contains(' ') {
      return NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map(Moment::Date)
        .map_err(|_| invalid());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
      return Ok(Moment::DateTime(dt.naive_utc()));
    }

    let bare = s.trim_end_matches('Z');
    DATETIME_FORMATS
      .iter()
      .find_map(|fmt| NaiveDateTime::parse_from_str(bare, fmt).ok())
      .map(Moment::DateTime)
      .ok_or_else(invalid)
  }

  fn as_start(self) -> NaiveDateTime {
    match self {
      Moment::Date(d) => d.and_time(NaiveTime::MIN),
      Moment::DateTime(dt) => dt,
    }
  }

  fn as_end(self) -> NaiveDateTime {
    match self {
      Moment::Date(d) => d.and_time(end_of_day()),
      Moment::DateTime(dt) => dt,
    }
  }
}

impl From<DateTime<Utc>> for Moment {
  fn from(dt: DateTime<Utc>) -> Self { Moment::DateTime(dt.naive_utc()) }
}

impl From<NaiveDate> for Moment {
  fn from(d: NaiveDate) -> Self { Moment::Date(d) }
}

impl From<NaiveDateTime> for Moment {
  fn from(dt: NaiveDateTime) -> Self { Moment::DateTime(dt) }
}

fn end_of_day() -> NaiveTime {
  NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

fn default_epoch() -> NaiveDateTime {
  NaiveDate::from_ymd_opt(2022, 1, 1)
    .unwrap_or_default()
    .and_time(NaiveTime::MIN)
}

// ─── Window ──────────────────────────────────────────────────────────────────

/// The half-open `[start, end)` range sent as `lastUpdatedStartDate` /
/// `lastUpdatedEndDate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
  pub start: String,
  pub end:   String,
}

/// Resolve the window to fetch.
///
/// 1. `start` and `end` both given: exactly that range.
/// 2. Only `start`: `start` through `now`.
/// 3. Neither: `last_sync` (or [`DEFAULT_EPOCH`]) through `now`.
///
/// An `end` without a `start` is ignored.
pub fn resolve(
  start:     Option<Moment>,
  end:       Option<Moment>,
  last_sync: Option<Moment>,
  now:       Moment,
) -> SyncWindow {
  let (from, to) = match (start, end) {
    (Some(s), Some(e)) => (s, e),
    (Some(s), None) => (s, now),
    (None, _) => (
      last_sync.unwrap_or(Moment::DateTime(default_epoch())),
      now,
    ),
  };

  SyncWindow {
    start: from.as_start().format(WINDOW_FORMAT).to_string(),
    end:   to.as_end().format(WINDOW_FORMAT).to_string(),
  }
}
