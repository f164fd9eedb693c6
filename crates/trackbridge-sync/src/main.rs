//! trackbridge command-line binary.
//!
//! Reads `trackbridge.toml` (or the path given with `--config`) layered under
//! `TRACKBRIDGE_*` environment variables, runs one operation and prints its
//! result as JSON. Scheduling is left to cron or a systemd timer.
//!
//! ```
//! trackbridge sync --events --start 2024-01-01
//! trackbridge aggregate --previous-month
//! ```

use std::{
  fs::OpenOptions,
  path::PathBuf,
  sync::{Arc, Mutex},
};

use anyhow::Context as _;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{Instrument as _, info_span, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};
use trackbridge_core::{
  entity::{EntityKind, KindFlags},
  window::Moment,
};
use trackbridge_remote::{DestinationSender, HttpTransport, RemoteFetcher};
use trackbridge_store_sqlite::SqliteStore;
use trackbridge_sync::{Settings, Syncer, logs};
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about = "Tracker to aggregate bridge")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "trackbridge.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Pull tracker records into the store.
  Sync {
    /// Only this organisation unit instead of every stored one.
    #[arg(long)]
    orgunit:     Option<String>,
    #[arg(long)]
    teis:        bool,
    #[arg(long)]
    enrollments: bool,
    #[arg(long)]
    attributes:  bool,
    #[arg(long)]
    events:      bool,
    /// Start of the window (`YYYY-MM-DD` or ISO 8601); defaults to the last sync.
    #[arg(long)]
    start:       Option<String>,
    #[arg(long, requires = "start")]
    end:         Option<String>,
  },

  /// Pull one reference collection into the store.
  Reference {
    #[arg(value_enum)]
    kind: ReferenceKind,
  },

  /// Aggregate the indicator view and send it to the destination.
  Aggregate {
    #[arg(long = "period")]
    periods:        Vec<String>,
    #[arg(long = "orgunit")]
    orgunits:       Vec<String>,
    /// Last month, for every stored organisation unit.
    #[arg(long, conflicts_with_all = ["periods", "orgunits"])]
    previous_month: bool,
  },

  /// Rebuild the indicator view.
  RefreshView,

  /// Truncate every log file in the log directory.
  RotateLogs,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReferenceKind {
  OrgUnits,
  DataElements,
}

impl From<ReferenceKind> for EntityKind {
  fn from(kind: ReferenceKind) -> Self {
    match kind {
      ReferenceKind::OrgUnits => EntityKind::OrgUnit,
      ReferenceKind::DataElements => EntityKind::DataElement,
    }
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let cli = Cli::parse();

  let settings = Settings::load(&cli.config)
    .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;

  init_tracing(&settings)?;

  let span = info_span!("run", id = %Uuid::new_v4());
  run(cli.command, settings).instrument(span).await
}

/// Log to stderr, and append to `<log_dir>/trackbridge.log` when the
/// directory can be created.
fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::INFO.into())
    .from_env_lossy();

  let file_layer = match std::fs::create_dir_all(&settings.log_dir) {
    Ok(()) => {
      let path = settings.log_dir.join(logs::LOG_FILE);
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
      Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
    }
    Err(_) => None,
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();
  Ok(())
}

type HttpSyncer = Syncer<SqliteStore, HttpTransport>;

async fn connect(settings: &Settings) -> anyhow::Result<HttpSyncer> {
  let store = SqliteStore::open_with(&settings.store_path, settings.store_options())
    .await
    .with_context(|| format!("failed to open store at {}", settings.store_path.display()))?;

  let source = HttpTransport::new(settings.source_api()).context("source client")?;
  let destination =
    HttpTransport::new(settings.destination_api()).context("destination client")?;

  Ok(Syncer::new(
    Arc::new(store),
    RemoteFetcher::new(source)
      .with_retry(settings.request_retry())
      .with_page_size(settings.http.page_size),
    DestinationSender::new(destination).with_retry(settings.request_retry()),
    settings.sync_options(),
  ))
}

async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
  match command {
    Command::Sync { orgunit, teis, enrollments, attributes, events, start, end } => {
      let chosen = KindFlags { teis, enrollments, attributes, events };
      let flags = if chosen == KindFlags::none() { KindFlags::all() } else { chosen };
      let start = start.as_deref().map(Moment::parse).transpose()?;
      let end = end.as_deref().map(Moment::parse).transpose()?;
      let syncer = connect(&settings).await?;
      let report = syncer.sync_tracker(orgunit.as_deref(), flags, start, end).await?;
      print(&report)
    }
    Command::Reference { kind } => {
      let kind = EntityKind::from(kind);
      let synced = connect(&settings).await?.fetch_reference(kind).await?;
      print(&serde_json::json!({ "kind": kind, "synced": synced }))
    }
    Command::Aggregate { periods, orgunits, previous_month } => {
      let syncer = connect(&settings).await?;
      let outcomes = if previous_month {
        syncer.aggregate_previous_month(Utc::now().date_naive()).await?
      } else {
        syncer.aggregate(&periods, &orgunits).await?
      };
      print(&outcomes)
    }
    Command::RefreshView => {
      let path = &settings.view.sql_path;
      let select = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read view query {}", path.display()))?;
      let outcome = connect(&settings).await?.refresh_view(&select, &settings.view.key_column).await?;
      print(&outcome)
    }
    Command::RotateLogs => {
      let cleared = logs::rotate_logs(&settings.log_dir).await?;
      print(&serde_json::json!({ "cleared": cleared }))
    }
  }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
