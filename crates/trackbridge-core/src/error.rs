//! Error types for `trackbridge-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid date {0:?}: expected YYYY-MM-DD or an ISO 8601 date-time")]
  InvalidDate(String),

  #[error("invalid period {0:?}: expected YYYYMM")]
  InvalidPeriod(String),

  #[error("missing required field {0:?}")]
  MissingField(&'static str),

  #[error("invalid identifier {0:?}")]
  InvalidIdentifier(String),

  #[error("unknown entity kind: {0:?}")]
  UnknownKind(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
