//! Orchestration for trackbridge: the [`Syncer`] that ties the remote
//! fetcher, the record transformer, the store and the destination sender
//! together, plus settings and log housekeeping used by the binary.

pub mod error;
pub mod logs;
pub mod settings;
pub mod syncer;

pub use error::{Error, Result};
pub use settings::Settings;
pub use syncer::{AggregateOutcome, Change, SyncOptions, SyncReport, Syncer};

#[cfg(test)]
mod tests;
