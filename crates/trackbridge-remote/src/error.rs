//! Error types for `trackbridge-remote`.

use thiserror::Error;
use trackbridge_core::retry::RetryError;

/// One failed HTTP exchange. Cloneable so retry bookkeeping can keep it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  #[error("could not build HTTP client: {0}")]
  Client(String),

  #[error("request failed: {0}")]
  Request(String),

  #[error("HTTP {status}: {body}")]
  Status { status: u16, body: String },

  #[error("response is not valid JSON: {0}")]
  Decode(String),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] trackbridge_core::Error),

  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error("GET {endpoint} failed after {attempts} attempts: {source}")]
  FetchFailed {
    endpoint: String,
    attempts: u32,
    source:   TransportError,
  },

  #[error("POST {endpoint} failed after {attempts} attempts: {source}")]
  SendFailed {
    endpoint: String,
    attempts: u32,
    source:   TransportError,
  },

  #[error("unexpected response from {endpoint}: {detail}")]
  UnexpectedShape { endpoint: String, detail: String },

  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Attempt count and last failure of a retried request.
pub(crate) fn exhausted(e: RetryError<TransportError>) -> (u32, TransportError) {
  match e {
    RetryError::Exhausted { attempts, source } => (attempts, source),
    RetryError::Aborted(source) => (1, source),
  }
}
