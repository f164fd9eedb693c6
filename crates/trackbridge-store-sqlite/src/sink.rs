//! Local JSON-lines audit trail of rows that failed to write and ids that
//! were deleted.
//!
//! Each table gets `<table>.failed.jsonl` and `<table>.deleted.jsonl` under
//! the sink directory. Sink failures are logged and never change the outcome
//! of the store operation that triggered them.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt as _;
use tracing::warn;
use trackbridge_core::entity::Row;

use crate::{Result, encode::encode_dt};

#[derive(Debug, Clone)]
pub struct LocalSink {
  dir: PathBuf,
}

impl LocalSink {
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  pub fn dir(&self) -> &Path { &self.dir }

  pub fn failed_path(&self, table: &str) -> PathBuf {
    self.dir.join(format!("{table}.failed.jsonl"))
  }

  pub fn deleted_path(&self, table: &str) -> PathBuf {
    self.dir.join(format!("{table}.deleted.jsonl"))
  }

  pub async fn record_failed(&self, table: &str, row: &Row, error: &str) {
    let line = json!({
      "at": encode_dt(Utc::now()),
      "table": table,
      "error": error,
      "row": row,
    });
    if let Err(e) = self.append(&self.failed_path(table), &[line]).await {
      warn!(table, error = %e, "could not write failed row to audit sink");
    }
  }

  pub async fn record_deleted(&self, table: &str, ids: &[String]) {
    if ids.is_empty() {
      return;
    }
    let at = encode_dt(Utc::now());
    let lines: Vec<Value> =
      ids.iter().map(|id| json!({"at": at, "table": table, "id": id})).collect();
    if let Err(e) = self.append(&self.deleted_path(table), &lines).await {
      warn!(table, error = %e, "could not write deleted ids to audit sink");
    }
  }

  async fn append(&self, path: &Path, lines: &[Value]) -> Result<()> {
    tokio::fs::create_dir_all(&self.dir).await?;
    let mut buf = String::new();
    for line in lines {
      buf.push_str(&serde_json::to_string(line)?);
      buf.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(path)
      .await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
  }
}
