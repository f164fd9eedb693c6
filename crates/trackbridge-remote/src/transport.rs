//! The [`Transport`] seam and its reqwest implementation.

use std::{future::Future, time::Duration};

use reqwest::{
  Client, RequestBuilder, Response,
  header::{CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde_json::Value;
use tracing::debug;

use crate::TransportError;

/// Query string pairs, sent in order.
pub type Query = [(String, String)];

/// Longest error body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// A JSON-over-HTTP endpoint. Paths are relative to the implementation's
/// base URL.
pub trait Transport: Send + Sync {
  fn get<'a>(
    &'a self,
    path: &'a str,
    query: &'a Query,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send + 'a;

  fn post<'a>(
    &'a self,
    path: &'a str,
    body: &'a Value,
  ) -> impl Future<Output = Result<Value, TransportError>> + Send + 'a;
}

// ─── Config ──────────────────────────────────────────────────────────────────

/// Connection settings for one remote instance.
#[derive(Debug, Clone)]
pub struct ApiConfig {
  pub base_url: String,
  pub username: String,
  pub password: String,
  pub timeout:  Duration,
  /// Verify TLS certificates.
  pub use_ssl:  bool,
}

impl ApiConfig {
  pub fn new(
    base_url: impl Into<String>,
    username: impl Into<String>,
    password: impl Into<String>,
  ) -> Self {
    Self {
      base_url: base_url.into(),
      username: username.into(),
      password: password.into(),
      timeout:  Duration::from_secs(30),
      use_ssl:  true,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn with_ssl(mut self, use_ssl: bool) -> Self {
    self.use_ssl = use_ssl;
    self
  }
}

// ─── HttpTransport ───────────────────────────────────────────────────────────

/// Cheap to clone: the inner [`reqwest::Client`] is `Arc`-based.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  config: ApiConfig,
}

impl HttpTransport {
  pub fn new(config: ApiConfig) -> Result<Self, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let client = Client::builder()
      .timeout(config.timeout)
      .default_headers(headers)
      .danger_accept_invalid_certs(!config.use_ssl)
      .build()
      .map_err(|e| TransportError::Client(e.to_string()))?;
    Ok(Self { client, config })
  }

  pub fn base_url(&self) -> &str { &self.config.base_url }

  fn url(&self, path: &str) -> String {
    format!(
      "{}/{}",
      self.config.base_url.trim_end_matches('/'),
      path.trim_start_matches('/')
    )
  }

  fn auth(&self, req: RequestBuilder) -> RequestBuilder {
    if self.config.username.is_empty() {
      req
    } else {
      req.basic_auth(&self.config.username, Some(&self.config.password))
    }
  }

  async fn finish(resp: Response) -> Result<Value, TransportError> {
    let status = resp.status();
    if !status.is_success() {
      let mut body = resp.text().await.unwrap_or_default();
      if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
        body.truncate(cut);
      }
      return Err(TransportError::Status { status: status.as_u16(), body });
    }
    let bytes = resp.bytes().await.map_err(|e| TransportError::Request(e.to_string()))?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
  }
}

impl Transport for HttpTransport {
  async fn get<'a>(&'a self, path: &'a str, query: &'a Query) -> Result<Value, TransportError> {
    debug!(path, params = query.len(), "GET");
    let resp = self
      .auth(self.client.get(self.url(path)))
      .query(query)
      .send()
      .await
      .map_err(|e| TransportError::Request(e.to_string()))?;
    Self::finish(resp).await
  }

  async fn post<'a>(&'a self, path: &'a str, body: &'a Value) -> Result<Value, TransportError> {
    debug!(path, "POST");
    let resp = self
      .auth(self.client.post(self.url(path)))
      .json(body)
      .send()
      .await
      .map_err(|e| TransportError::Request(e.to_string()))?;
    Self::finish(resp).await
  }
}
