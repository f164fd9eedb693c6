//! Error type for `trackbridge-store-sqlite`.

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] trackbridge_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A row handed to a write has no usable value in its key column.
  #[error("row for {table:?} has no value for key column {key:?}")]
  MissingKey { table: String, key: String },

  #[error("invalid identifier {0:?}")]
  InvalidIdentifier(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
  /// Busy, locked and closed-connection failures clear up on their own and
  /// are worth retrying; everything else is structural.
  pub fn is_transient(&self) -> bool {
    match self {
      Error::Database(tokio_rusqlite::Error::ConnectionClosed) => true,
      Error::Database(tokio_rusqlite::Error::Rusqlite(e)) => is_busy(e),
      _ => false,
    }
  }
}

fn is_busy(err: &rusqlite::Error) -> bool {
  match err {
    rusqlite::Error::SqliteFailure(code, _) => {
      matches!(code.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    }
    _ => false,
  }
}

/// SQLite reports re-adding an existing column as a generic error; a racing
/// writer may have added it first.
pub(crate) fn is_duplicate_column(err: &rusqlite::Error) -> bool {
  match err {
    rusqlite::Error::SqliteFailure(_, Some(message)) => {
      message.contains("duplicate column name")
    }
    _ => false,
  }
}
