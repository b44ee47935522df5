use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::ReadStrategy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub storage: StorageConfig,
  pub remote: RemoteConfig,
  pub connectivity: ConnectivityConfig,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/catalog-sync/offline.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  /// Catalog API root, e.g. https://api.example.com/v1
  pub base_url: Option<String>,
  pub timeout_ms: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL to probe for reachability (defaults to remote.base_url)
  pub probe_url: Option<String>,
  pub poll_interval_secs: u64,
  pub probe_timeout_ms: u64,
  /// Treat a failing reachability probe as online
  pub fail_open: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      poll_interval_secs: 30,
      probe_timeout_ms: 3_000,
      fail_open: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long before cached data is considered stale
  pub max_age_secs: i64,
  pub strategy: ReadStrategy,
  /// Serve entries past max age when the live fetch fails
  pub serve_stale: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_age_secs: 300,
      strategy: ReadStrategy::default(),
      serve_stale: true,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Park a mutation after this many failed replays (unset: retry forever)
  pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset (default: info)
  pub level: Option<String>,
  /// Directory for log files (default: next to the database)
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./catalog-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/catalog-sync/config.yaml
  /// 4. Built-in defaults
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("catalog-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("catalog-sync").join("config.yaml");
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

  /// Parse configuration from YAML text.
  pub fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means all defaults
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    if chrono::Duration::try_seconds(config.cache.max_age_secs).is_none() {
      return Err(eyre!(
        "cache.max_age_secs {} is out of range",
        config.cache.max_age_secs
      ));
    }
    Ok(config)
  }

  /// URL used for reachability probing, if any.
  pub fn probe_url(&self) -> Option<&str> {
    self
      .connectivity
      .probe_url
      .as_deref()
      .or(self.remote.base_url.as_deref())
  }

  /// Get the API token from the environment, if set.
  ///
  /// Checks CATALOG_SYNC_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("CATALOG_SYNC_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
