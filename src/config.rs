use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::StalenessPolicy;
use crate::sync::ReconnectPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub staleness: StalenessConfig,
  #[serde(default)]
  pub live: LiveConfig,
  #[serde(default)]
  pub pagination: PaginationConfig,
  /// Signed-in user id, standing in for the app's auth flow
  pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the document store (e.g., "https://store.example.com/")
  #[serde(default)]
  pub url: String,
  /// Optional project namespace prepended to every collection path
  pub project: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to run every query against the remote store
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Cache database path (default: $XDG_DATA_HOME/rostersync/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StalenessConfig {
  #[serde(default = "default_staleness_secs")]
  pub default_secs: u64,
  /// Entity type (e.g., "live_game") to window in seconds
  #[serde(default)]
  pub overrides: BTreeMap<String, u64>,
}

impl Default for StalenessConfig {
  fn default() -> Self {
    Self {
      default_secs: default_staleness_secs(),
      overrides: BTreeMap::new(),
    }
  }
}

impl StalenessConfig {
  pub fn policy(&self) -> StalenessPolicy {
    self
      .overrides
      .iter()
      .fold(
        StalenessPolicy::new(seconds(self.default_secs)),
        |policy, (entity_type, secs)| policy.with_override(entity_type.clone(), seconds(*secs)),
      )
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
  #[serde(default = "default_max_reconnect_attempts")]
  pub max_reconnect_attempts: u32,
  #[serde(default = "default_initial_backoff_ms")]
  pub initial_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
}

impl Default for LiveConfig {
  fn default() -> Self {
    Self {
      max_reconnect_attempts: default_max_reconnect_attempts(),
      initial_backoff_ms: default_initial_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
    }
  }
}

impl LiveConfig {
  pub fn reconnect_policy(&self) -> ReconnectPolicy {
    ReconnectPolicy {
      max_attempts: self.max_reconnect_attempts,
      initial_backoff: std::time::Duration::from_millis(self.initial_backoff_ms),
      max_backoff: std::time::Duration::from_millis(self.max_backoff_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
  #[serde(default = "default_page_size")]
  pub page_size: usize,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
    }
  }
}

fn default_true() -> bool {
  true
}

fn default_staleness_secs() -> u64 {
  3600
}

fn default_max_reconnect_attempts() -> u32 {
  5
}

fn default_initial_backoff_ms() -> u64 {
  500
}

fn default_max_backoff_ms() -> u64 {
  30_000
}

fn default_page_size() -> usize {
  20
}

/// chrono panics past i64::MAX milliseconds; clamp absurd config values.
fn seconds(secs: u64) -> Duration {
  const MAX_SECS: u64 = (i64::MAX / 1000) as u64;
  Duration::seconds(secs.min(MAX_SECS) as i64)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rostersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rostersync/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/rostersync/config.yaml\n\
                 with at least `remote: {{ url: ... }}`, or pass --offline-demo."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rostersync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rostersync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get the document store API token from environment variables.
  ///
  /// Checks ROSTERSYNC_TOKEN. A missing token means anonymous access.
  pub fn get_api_token() -> Option<String> {
    std::env::var("ROSTERSYNC_TOKEN").ok()
  }
}
