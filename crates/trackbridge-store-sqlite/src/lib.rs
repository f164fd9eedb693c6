//! SQLite backend for the trackbridge record store.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Entity tables are created and widened
//! on demand from the rows written to them.

mod cache;
mod encode;
mod schema;
mod sink;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use schema::SqlType;
pub use sink::LocalSink;
pub use store::{RefreshOutcome, SqliteStore, StoreOptions};

#[cfg(test)]
mod tests;
