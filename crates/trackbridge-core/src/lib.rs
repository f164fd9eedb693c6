//! Core types and pure logic for the trackbridge tracker/aggregate bridge.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! remote client, the SQLite store and the sync orchestration all depend on
//! it; it depends on nothing but serialisation and time handling.

// We intentionally use native `async fn` in traits.
#![allow(async_fn_in_trait)]

pub mod clean;
pub mod entity;
pub mod error;
pub mod indicator;
pub mod period;
pub mod record;
pub mod retry;
pub mod store;
pub mod transform;
pub mod window;

pub use error::{Error, Result};
