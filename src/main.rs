use cashpoints::api::{EntityKind, HttpNetwork};
use cashpoints::cache::{FsIconStore, SqliteStorage};
use cashpoints::config::Config;
use cashpoints::engine::Engine;
use cashpoints::event::EventHandler;
use cashpoints::notify::{Notification, Notifier};

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
  Bank,
  Town,
}

impl From<Kind> for EntityKind {
  fn from(kind: Kind) -> Self {
    match kind {
      Kind::Bank => EntityKind::Bank,
      Kind::Town => EntityKind::Town,
    }
  }
}

#[derive(Parser, Debug)]
#[command(name = "cashpoints")]
#[command(about = "Synchronize the cash points catalog into the local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cashpoints/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Server url, overrides the config file
  #[arg(short, long)]
  server: Option<String>,

  /// Only synchronize this kind
  #[arg(long, value_enum)]
  only: Option<Kind>,

  /// Log to stderr instead of the log file
  #[arg(long)]
  log_stderr: bool,
}

fn init_logging(data_dir: &Path, to_stderr: bool) -> Option<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cashpoints=info"));

  if to_stderr {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return None;
  }

  let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "cashpoints.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Some(guard)
}

async fn log_notifications(mut rx: UnboundedReceiver<Notification>) {
  while let Some(notification) = rx.recv().await {
    match notification {
      Notification::Progress { kind, done, total } => debug!(%kind, done, total, "progress"),
      Notification::SyncError {
        kind,
        request_id,
        message,
      } => error!(%kind, ?request_id, "sync failed: {}", message),
      Notification::IconError { kind, id, message } => warn!(%kind, %id, "icon: {}", message),
      Notification::ServerDataReceived { kind } => info!(%kind, "server data received"),
      Notification::Reachability(reachable) => info!(reachable, "server reachability"),
      other => debug!(?other, "notification"),
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(server) = args.server {
    config.server.url = server;
    config.validate()?;
  }

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _guard = init_logging(&data_dir, args.log_stderr);

  let mut events = EventHandler::new(config.sweep_interval());
  let network = HttpNetwork::new(&config.server.url, events.sender())?;
  let store = SqliteStorage::open(&data_dir)?;
  let icons = FsIconStore::open(&data_dir.join("icons"))?;
  let (notifier, rx) = Notifier::channel();
  tokio::spawn(log_notifications(rx));

  let settings = config.engine_settings(Some(data_dir.join("snapshots")));
  let mut engine = Engine::new(settings, Box::new(network), store, Box::new(icons), notifier)?;

  info!(url = %config.server.url, "checking server");
  engine.ping();
  engine.run_until_idle(&mut events).await;
  if engine.reachable() != Some(true) {
    return Err(eyre!("Server {} is unreachable", config.server.url));
  }

  let kinds = match args.only {
    Some(kind) => vec![kind.into()],
    None => vec![EntityKind::Bank, EntityKind::Town],
  };
  for kind in kinds {
    engine.refresh(kind);
  }
  engine.run_until_idle(&mut events).await;

  for (kind, phase, done, total) in engine.summary() {
    info!(%kind, ?phase, done, total, "sync summary");
    println!("{:<6} {:?}: {}/{}", kind, phase, done, total);
  }

  Ok(())
}
