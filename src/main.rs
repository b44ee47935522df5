mod event;

use catalog_sync::cache::CacheSource;
use catalog_sync::config::{Config, LogConfig};
use catalog_sync::connectivity::{ConnectivityMonitor, ConnectivityState, HttpProbe};
use catalog_sync::queue::{MutationKind, MutationRecord};
use catalog_sync::remote::HttpClient;
use catalog_sync::store::SqliteStore;
use catalog_sync::sync::{ApplierRegistry, DrainOutcome, DrainReport, RemoteApplier};
use catalog_sync::{OfflineClient, WriteOutcome};
use chrono::Duration as ChronoDuration;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use event::{Event, EventHandler};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "catalog-sync")]
#[command(about = "Inspect and drive the offline catalog cache and mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/catalog-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the offline database (overrides storage.path)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Act as if the network were down
  #[arg(long)]
  offline: bool,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, cache and queue counts
  Status,
  /// List queued mutations
  Pending {
    /// List parked mutations instead
    #[arg(long)]
    parked: bool,
  },
  /// Queue a mutation without attempting it
  Enqueue {
    kind: MutationKind,
    target: String,
    /// JSON payload, e.g. '{"id":"p1","price":500}'
    payload: String,
  },
  /// Apply a mutation now, queueing it if that fails
  Write {
    kind: MutationKind,
    target: String,
    payload: String,
  },
  /// Drain the mutation queue now
  Sync,
  /// Read a path through the cache
  Fetch {
    /// Path relative to remote.base_url, e.g. "listings?category=bikes"
    path: String,
    /// Max age in seconds (default: cache.max_age_secs)
    #[arg(long)]
    max_age: Option<i64>,
  },
  /// Drop every cached entry
  ClearCache,
  /// Drop a pending or parked mutation
  Purge { id: String },
  /// Move parked mutations back into the queue
  Requeue,
  /// Watch connectivity and drain whenever it comes back
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override database path if specified on command line
  if let Some(db) = args.db.clone() {
    config.storage.path = Some(db);
  }

  let db_path = match &config.storage.path {
    Some(p) => p.clone(),
    None => SqliteStore::default_path()?,
  };
  let _log_guard = init_logging(&config.log, &db_path, args.log_stderr)?;
  info!(version = env!("CARGO_PKG_VERSION"), db = %db_path.display(), "catalog-sync starting");

  let store = SqliteStore::open(&db_path)?;
  let http = config
    .remote
    .base_url
    .is_some()
    .then(|| HttpClient::new(&config.remote, Config::api_token()))
    .transpose()?;

  let monitor = ConnectivityMonitor::new(config.connectivity.fail_open);
  let probe = match config.probe_url() {
    Some(url) if !args.offline => Some(Arc::new(HttpProbe::new(
      url,
      Duration::from_millis(config.connectivity.probe_timeout_ms),
    )?)),
    _ => None,
  };

  let applier: Arc<dyn RemoteApplier> = match &http {
    Some(client) => Arc::new(client.clone()),
    // Nothing to replay against; drains leave everything queued
    None => Arc::new(ApplierRegistry::new()),
  };

  let client = OfflineClient::builder(Arc::new(store), monitor.clone(), applier)
    .with_config(&config)
    .build()?;

  if args.offline {
    monitor.report(ConnectivityState::offline());
  } else if let Some(probe) = &probe {
    monitor.probe_once(&**probe).await;
  }

  match args.command {
    Command::Status => {
      print_json(&client.status().await?)?;
    }
    Command::Pending { parked } => {
      let records = if parked {
        client.parked().await?
      } else {
        client.pending().await?
      };
      print_records(&records);
    }
    Command::Enqueue {
      kind,
      target,
      payload,
    } => {
      let record = client.enqueue(kind, &target, parse_payload(&payload)?).await?;
      println!("queued {}", record.id);
    }
    Command::Write {
      kind,
      target,
      payload,
    } => {
      let http = require_remote(&http)?;
      let payload = parse_payload(&payload)?;
      let (target_ref, body) = (target.as_str(), &payload);
      let outcome = client
        .write_through(kind, &target, payload.clone(), move || async move {
          http.send(kind, target_ref, body, None).await
        })
        .await?;
      match outcome {
        WriteOutcome::Applied => println!("applied"),
        WriteOutcome::Queued(record) => println!("queued {}", record.id),
      }
    }
    Command::Sync => {
      require_remote(&http)?;
      match client.force_sync().await? {
        DrainOutcome::Completed(report) => print_report(&report),
        DrainOutcome::AlreadyRunning => println!("a sync is already running"),
      }
    }
    Command::Fetch { path, max_age } => {
      let http = require_remote(&http)?;
      let max_age = match max_age {
        Some(secs) => ChronoDuration::try_seconds(secs)
          .ok_or_else(|| eyre!("--max-age {} is out of range", secs))?,
        None => client.default_max_age(),
      };
      let key = format!("path:{}", path);
      let path_ref = path.as_str();
      let result = client
        .read_through_with_source::<Value, _, _>(&key, max_age, move || http.get_json(path_ref))
        .await?;
      if result.source != CacheSource::Network {
        eprintln!(
          "served from cache ({:?}, cached at {})",
          result.source,
          result
            .cached_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default()
        );
      }
      print_json(&result.data)?;
    }
    Command::ClearCache => {
      let removed = client.clear_cache().await?;
      println!("removed {} cached entries", removed);
    }
    Command::Purge { id } => {
      if client.purge(&id).await? {
        println!("purged {}", id);
      } else {
        return Err(eyre!("No queued or parked mutation with id {}", id));
      }
    }
    Command::Requeue => {
      let count = client.requeue_parked().await?;
      println!("requeued {} parked mutations", count);
    }
    Command::Watch => {
      require_remote(&http)?;
      let probe =
        probe.ok_or_else(|| eyre!("watch needs connectivity.probe_url or remote.base_url"))?;
      watch(&client, &monitor, probe, config.connectivity.poll_interval_secs).await?;
    }
  }

  Ok(())
}

async fn watch(
  client: &OfflineClient,
  monitor: &ConnectivityMonitor,
  probe: Arc<HttpProbe>,
  poll_interval_secs: u64,
) -> Result<()> {
  let mut events = EventHandler::new(Duration::from_secs(60));

  let tx = events.sender();
  let _connectivity = client.subscribe_connectivity(move |transition| {
    let _ = tx.send(Event::Connectivity(transition));
  });
  events.forward_reports(client.drain_reports());

  let _polling = monitor.spawn_polling(probe, Duration::from_secs(poll_interval_secs.max(1)));

  // Whatever is already queued gets a pass right away if we start online
  if monitor.is_online() {
    client.force_sync().await?;
  }

  while let Some(event) = events.next().await {
    match event {
      Event::Connectivity(transition) => {
        let state = if transition.current.reachable {
          "online"
        } else {
          "offline"
        };
        println!("connectivity: {} ({:?})", state, transition.current.transport);
      }
      Event::Drained(report) => print_report(&report),
      Event::Tick => {
        let status = client.status().await?;
        println!(
          "status: {} | {} queued | {} parked | {} cached",
          if status.online { "online" } else { "offline" },
          status.queued_count,
          status.parked_count,
          status.cached_count
        );
      }
      Event::Shutdown => break,
    }
  }

  Ok(())
}

fn init_logging(config: &LogConfig, db_path: &Path, to_stderr: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(config.level.as_deref().unwrap_or("info")))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let dir = match &config.directory {
    Some(d) => d.clone(),
    None => db_path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from(".")),
  };
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "catalog-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(Some(guard))
}

fn require_remote(http: &Option<HttpClient>) -> Result<&HttpClient> {
  http
    .as_ref()
    .ok_or_else(|| eyre!("This command needs remote.base_url in the config"))
}

fn parse_payload(payload: &str) -> Result<Value> {
  serde_json::from_str(payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_records(records: &[MutationRecord]) {
  if records.is_empty() {
    println!("(none)");
    return;
  }
  for r in records {
    let error = r
      .last_error
      .as_deref()
      .map(|e| format!("  last error: {}", e))
      .unwrap_or_default();
    println!(
      "{}  {:<6} {:<16} attempts={} {}{}",
      r.id,
      r.kind.to_string(),
      r.target,
      r.attempts,
      r.payload,
      error
    );
  }
}

fn print_report(report: &DrainReport) {
  println!(
    "sync: {} attempted, {} applied, {} failed, {} parked",
    report.attempted,
    report.applied.len(),
    report.failed.len(),
    report.parked.len()
  );
  for failure in &report.failed {
    println!("  {} ({}): {}", failure.id, failure.target, failure.error);
  }
}
