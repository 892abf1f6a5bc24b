use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::engine::EngineSettings;
use crate::request::RequestSettings;
use crate::sync::SyncSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub requests: RequestsConfig,
  #[serde(default)]
  pub ping: PingConfig,
  /// Local data directory (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub url: String,
  /// Requests without an answer after this long are timed out
  pub expire_ms: u64,
  /// How often pending requests are checked for expiry
  pub sweep_ms: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8080".to_string(),
      expire_ms: 1000,
      sweep_ms: 500,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub attempts: u32,
  pub batch_size: usize,
  pub icon_parallelism: usize,
  pub snapshot_max_age_hours: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      attempts: 3,
      batch_size: 128,
      icon_parallelism: 4,
      snapshot_max_age_hours: 24,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
  /// Stored cash points younger than this are not fetched again
  pub cashpoint_fresh_secs: u64,
}

impl Default for RequestsConfig {
  fn default() -> Self {
    Self {
      cashpoint_fresh_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
  pub attempts: u32,
}

impl Default for PingConfig {
  fn default() -> Self {
    Self { attempts: 3 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cashpoints.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cashpoints/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cashpoints.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cashpoints").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is a valid, all-defaults config
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Reject settings the engine cannot run with.
  pub fn validate(&self) -> Result<()> {
    if self.sync.batch_size == 0 {
      return Err(eyre!("sync.batch_size must be positive"));
    }
    if self.sync.attempts == 0 {
      return Err(eyre!("sync.attempts must be positive"));
    }
    if self.sync.icon_parallelism == 0 {
      return Err(eyre!("sync.icon_parallelism must be positive"));
    }
    if self.ping.attempts == 0 {
      return Err(eyre!("ping.attempts must be positive"));
    }
    if self.server.sweep_ms == 0 {
      return Err(eyre!("server.sweep_ms must be positive"));
    }
    Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", self.server.url, e))?;
    Ok(())
  }

  /// Directory holding the database, snapshots, icons and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|dir| dir.join("cashpoints"))
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.server.sweep_ms)
  }

  pub fn engine_settings(&self, snapshot_dir: Option<PathBuf>) -> EngineSettings {
    EngineSettings {
      sync: SyncSettings {
        attempts: self.sync.attempts,
        batch_size: self.sync.batch_size,
        icon_parallelism: self.sync.icon_parallelism,
      },
      requests: RequestSettings {
        attempts: self.sync.attempts,
        batch_size: self.sync.batch_size,
        fresh_for: Duration::from_secs(self.requests.cashpoint_fresh_secs),
      },
      ping_attempts: self.ping.attempts,
      expire_after: Duration::from_millis(self.server.expire_ms),
      snapshot_dir,
      snapshot_max_age: Duration::from_secs(self.sync.snapshot_max_age_hours.saturating_mul(3600)),
    }
  }
}
