//! HTTP side of trackbridge.
//!
//! [`RemoteFetcher`] reads the source API (retried GETs, pagination and a
//! bounded fan-out over many organisation units); [`DestinationSender`]
//! writes aggregate data value sets to the destination. Both sit on the
//! [`Transport`] trait so tests can swap the network for an in-process fake.

// We intentionally use native `async fn` in traits.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod fetcher;
pub mod sender;
pub mod transport;

pub use error::{Error, Result, TransportError};
pub use fetcher::{Endpoint, RemoteFetcher, fan_out};
pub use sender::{DestinationSender, SendResult, SendStatus};
pub use transport::{ApiConfig, HttpTransport, Query, Transport};
