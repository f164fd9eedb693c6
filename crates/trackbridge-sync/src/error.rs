//! Error types for `trackbridge-sync`.

use thiserror::Error;
use trackbridge_core::entity::EntityKind;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Core(#[from] trackbridge_core::Error),

  #[error(transparent)]
  Remote(#[from] trackbridge_remote::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("{0} is not reference data")]
  NotReference(EntityKind),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  pub(crate) fn store<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
    Error::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
