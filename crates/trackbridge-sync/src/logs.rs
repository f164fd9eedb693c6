//! Log file housekeeping.

use std::path::Path;

use tracing::{error, info, warn};

use crate::Result;

pub const LOG_FILE: &str = "trackbridge.log";

/// Truncate every `*.log` file directly inside `dir`, returning how many
/// were cleared. Files held open by a writer in append mode keep working.
///
/// A missing directory clears nothing. A file that cannot be truncated is
/// logged and skipped.
pub async fn rotate_logs(dir: &Path) -> Result<usize> {
  if !tokio::fs::try_exists(dir).await? {
    warn!(dir = %dir.display(), "log directory does not exist");
    return Ok(0);
  }

  let mut cleared = 0;
  let mut entries = tokio::fs::read_dir(dir).await?;
  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    if path.extension().is_none_or(|ext| ext != "log") || !entry.file_type().await?.is_file() {
      continue;
    }
    match tokio::fs::File::create(&path).await {
      Ok(_) => {
        info!(file = %path.display(), "cleared log file");
        cleared += 1;
      }
      Err(e) => error!(file = %path.display(), error = %e, "could not clear log file"),
    }
  }
  Ok(cleared)
}
