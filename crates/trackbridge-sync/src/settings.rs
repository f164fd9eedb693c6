//! Layered runtime settings.
//!
//! An optional TOML file is read first, then `TRACKBRIDGE_*` environment
//! variables override it (`__` separates nested keys, so
//! `TRACKBRIDGE_SOURCE__PASSWORD` sets `source.password`).

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use trackbridge_core::retry::RetryPolicy;
use trackbridge_remote::ApiConfig;
use trackbridge_store_sqlite::StoreOptions;

use crate::{Result, syncer::SyncOptions};

pub const ENV_PREFIX: &str = "TRACKBRIDGE";

// ─── Sections ────────────────────────────────────────────────────────────────

/// Credentials for one remote instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
  pub url:      String,
  pub username: String,
  pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
  pub name:       String,
  /// File holding the `SELECT` the view is rebuilt from.
  pub sql_path:   PathBuf,
  pub key_column: String,
}

impl Default for ViewSettings {
  fn default() -> Self {
    Self {
      name:       "indicators_matview".into(),
      sql_path:   "views/indicators_matview.sql".into(),
      key_column: "uid".into(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
  pub timeout_secs: u64,
  pub use_ssl:      bool,
  pub page_size:    u32,
}

impl Default for HttpSettings {
  fn default() -> Self { Self { timeout_secs: 60, use_ssl: true, page_size: 100 } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_retries:      u32,
  pub retry_delay_secs: u64,
  /// Delay multiplier for the exponential (store) policy.
  pub back_off:         f64,
}

impl Default for RetrySettings {
  fn default() -> Self { Self { max_retries: 3, retry_delay_secs: 3, back_off: 2.0 } }
}

// ─── Settings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  pub source:             RemoteSettings,
  pub destination:        RemoteSettings,
  pub program:            String,
  #[serde(default = "default_store_path")]
  pub store_path:         PathBuf,
  #[serde(default = "default_orgunit_level")]
  pub orgunit_level:      u32,
  #[serde(default = "default_dataset_id")]
  pub dataset_id:         String,
  #[serde(default = "default_indicator_map_path")]
  pub indicator_map_path: PathBuf,
  #[serde(default)]
  pub view:               ViewSettings,
  #[serde(default)]
  pub http:               HttpSettings,
  #[serde(default)]
  pub retry:              RetrySettings,
  #[serde(default = "default_max_workers")]
  pub max_workers:        usize,
  #[serde(default = "default_batch_size")]
  pub batch_size:         usize,
  #[serde(default)]
  pub force_reinit:       bool,
  #[serde(default = "default_audit_dir")]
  pub audit_dir:          PathBuf,
  #[serde(default = "default_log_dir")]
  pub log_dir:            PathBuf,
  #[serde(default = "default_true")]
  pub send_to_remote:     bool,
}

fn default_store_path() -> PathBuf { "data/trackbridge.db".into() }
fn default_orgunit_level() -> u32 { 5 }
fn default_dataset_id() -> String { "mxX2xHChatk".into() }
fn default_indicator_map_path() -> PathBuf { "helpers/indicators_map.json".into() }
fn default_max_workers() -> usize { 10 }
fn default_batch_size() -> usize { 10_000 }
fn default_audit_dir() -> PathBuf { "data/audit".into() }
fn default_log_dir() -> PathBuf { "logs".into() }
fn default_true() -> bool { true }

impl Settings {
  /// Read `path` if it exists, then apply environment overrides.
  pub fn load(path: &Path) -> Result<Self> {
    Self::build(File::from(path).required(false))
  }

  /// Parse TOML text, then apply environment overrides.
  pub fn from_toml(text: &str) -> Result<Self> {
    Self::build(File::from_str(text, FileFormat::Toml))
  }

  fn build<S>(file: S) -> Result<Self>
  where
    S: config::Source + Send + Sync + 'static,
  {
    let settings = Config::builder()
      .add_source(file)
      .add_source(
        Environment::with_prefix(ENV_PREFIX)
          .prefix_separator("_")
          .separator("__"),
      )
      .build()?
      .try_deserialize()?;
    Ok(settings)
  }

  // ── Derived component settings ────────────────────────────────────────

  fn delay(&self) -> Duration { Duration::from_secs(self.retry.retry_delay_secs) }

  /// Fixed-delay policy for remote requests.
  pub fn request_retry(&self) -> RetryPolicy {
    RetryPolicy::fixed(self.retry.max_retries, self.delay())
  }

  pub fn store_options(&self) -> StoreOptions {
    StoreOptions::default()
      .with_batch_size(self.batch_size)
      .with_row_retry(RetryPolicy::fixed(self.retry.max_retries, self.delay()))
      .with_batch_retry(RetryPolicy::exponential(
        self.retry.max_retries,
        self.delay(),
        self.retry.back_off,
      ))
      .with_force_reinit(self.force_reinit)
      .with_audit_dir(&self.audit_dir)
  }

  fn api(&self, remote: &RemoteSettings) -> ApiConfig {
    ApiConfig::new(&remote.url, &remote.username, &remote.password)
      .with_timeout(Duration::from_secs(self.http.timeout_secs))
      .with_ssl(self.http.use_ssl)
  }

  pub fn source_api(&self) -> ApiConfig { self.api(&self.source) }

  pub fn destination_api(&self) -> ApiConfig { self.api(&self.destination) }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      program:            self.program.clone(),
      orgunit_level:      Some(self.orgunit_level),
      max_workers:        self.max_workers,
      dataset_id:         self.dataset_id.clone(),
      indicator_map_path: self.indicator_map_path.clone(),
      view_name:          self.view.name.clone(),
      send_to_remote:     self.send_to_remote,
      ..SyncOptions::default()
    }
  }
}
