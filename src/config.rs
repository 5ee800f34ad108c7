use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a timestamp conflict between a pending local edit and a newer remote
/// revision is resolved.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
  /// Remote state overwrites the local edit; the edit is discarded.
  #[default]
  RemoteWins,
  /// The local edit survives until its own sync-back; remote value ignored.
  LocalWins,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  /// Cache database path. Overridable by PDASH_CACHE_PATH.
  pub cache_path: Option<PathBuf>,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub query: QueryConfig,
  /// The closed status set, in board order.
  #[serde(default = "default_statuses")]
  pub statuses: Vec<String>,
  /// Statuses counted as in-progress for project aggregates.
  #[serde(default = "default_active_statuses")]
  pub active_statuses: Vec<String>,
  #[serde(default, rename = "conflict-policy")]
  pub conflict_policy: ConflictPolicy,
  /// Days tombstoned entities are retained before purge. 0 disables purging.
  #[serde(default = "default_tombstone_retention")]
  pub tombstone_retention_days: u32,
  /// Default member capacity in points.
  #[serde(default = "default_capacity")]
  pub default_capacity: i64,
  /// Per-member capacity overrides, keyed by member id.
  #[serde(default)]
  pub capacity_overrides: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  #[serde(default = "default_remote_url")]
  pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_poll_interval")]
  pub poll_interval_secs: u64,
  /// Retry attempts per fetch call on transient errors.
  #[serde(default = "default_fetch_retries")]
  pub fetch_retries: u32,
  #[serde(default = "default_retry_base_ms")]
  pub retry_base_ms: u64,
  /// Minimum quiet period after a failed run before polling retries.
  #[serde(default = "default_failure_cooldown")]
  pub failure_cooldown_secs: u64,
  /// Upper bound on the polling backoff after repeated failures.
  #[serde(default = "default_max_backoff")]
  pub max_backoff_secs: u64,
  #[serde(default = "default_fetch_timeout")]
  pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueryConfig {
  #[serde(default = "default_result_limit")]
  pub result_limit: usize,
}

fn default_remote_url() -> String {
  "https://api.linear.app/graphql".to_string()
}

fn default_statuses() -> Vec<String> {
  ["Todo", "In Progress", "Review", "Done"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_active_statuses() -> Vec<String> {
  ["In Progress", "Review"].iter().map(|s| s.to_string()).collect()
}

fn default_tombstone_retention() -> u32 {
  30
}

fn default_capacity() -> i64 {
  10
}

fn default_poll_interval() -> u64 {
  300
}

fn default_fetch_retries() -> u32 {
  3
}

fn default_retry_base_ms() -> u64 {
  500
}

fn default_failure_cooldown() -> u64 {
  60
}

fn default_max_backoff() -> u64 {
  900
}

fn default_fetch_timeout() -> u64 {
  30
}

fn default_result_limit() -> usize {
  500
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self { url: default_remote_url() }
  }
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs: default_poll_interval(),
      fetch_retries: default_fetch_retries(),
      retry_base_ms: default_retry_base_ms(),
      failure_cooldown_secs: default_failure_cooldown(),
      max_backoff_secs: default_max_backoff(),
      fetch_timeout_secs: default_fetch_timeout(),
    }
  }
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self { result_limit: default_result_limit() }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      remote: RemoteConfig::default(),
      cache_path: None,
      sync: SyncConfig::default(),
      query: QueryConfig::default(),
      statuses: default_statuses(),
      active_statuses: default_active_statuses(),
      conflict_policy: ConflictPolicy::default(),
      tombstone_retention_days: default_tombstone_retention(),
      default_capacity: default_capacity(),
      capacity_overrides: BTreeMap::new(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./pdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/pdash/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
    let local = PathBuf::from("pdash.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("pdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the remote API token from environment variables.
  ///
  /// Checks PDASH_API_TOKEN first, then LINEAR_API_KEY as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("PDASH_API_TOKEN")
      .or_else(|_| std::env::var("LINEAR_API_KEY"))
      .map_err(|_| {
        eyre!("API token not found. Set PDASH_API_TOKEN or LINEAR_API_KEY environment variable.")
      })
  }

  /// Resolve the cache database path.
  ///
  /// PDASH_CACHE_PATH wins over the config file, which wins over the default
  /// data-dir location.
  pub fn resolve_cache_path(&self) -> Result<PathBuf> {
    if let Ok(env_path) = std::env::var("PDASH_CACHE_PATH") {
      return Ok(PathBuf::from(env_path));
    }
    if let Some(path) = &self.cache_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("pdash").join("cache.db"))
  }

  /// Capacity for a member, honoring per-member overrides.
  pub fn capacity_for(&self, member_id: &str) -> i64 {
    self
      .capacity_overrides
      .get(member_id)
      .copied()
      .unwrap_or(self.default_capacity)
  }
}
