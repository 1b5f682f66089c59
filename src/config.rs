use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{Route, SyncOptions};

/// TTL used for cache namespaces without an explicit entry.
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  pub storage: StorageConfig,
  pub remote: RemoteConfig,
  pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  pub drain_debounce_ms: u64,
  pub request_timeout_ms: u64,
  pub retry_backoff_ms: u64,
  pub max_backoff_ms: u64,
  /// Periodic background drain; `null` disables it
  pub safety_net_interval_ms: Option<u64>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      drain_debounce_ms: 250,
      request_timeout_ms: 15_000,
      retry_backoff_ms: 1_000,
      max_backoff_ms: 60_000,
      safety_net_interval_ms: Some(60_000),
    }
  }
}

impl SyncConfig {
  pub fn options(&self) -> SyncOptions {
    SyncOptions {
      max_retries: self.max_retries,
      drain_debounce: Duration::from_millis(self.drain_debounce_ms),
      request_timeout: Duration::from_millis(self.request_timeout_ms),
      retry_backoff: Duration::from_millis(self.retry_backoff_ms),
      max_backoff: Duration::from_millis(self.max_backoff_ms),
      safety_net_interval: self.safety_net_interval_ms.map(Duration::from_millis),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub capacity: usize,
  pub fetch_timeout_ms: Option<u64>,
  /// TTL in milliseconds per namespace (e.g. `food: 600000`)
  pub namespaces: BTreeMap<String, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let namespaces = [
      ("food".to_string(), 10 * 60 * 1000),
      ("plan".to_string(), DEFAULT_TTL_MS),
      ("ai".to_string(), 60 * 60 * 1000),
    ]
    .into_iter()
    .collect();

    Self {
      capacity: crate::cache::DEFAULT_CAPACITY,
      fetch_timeout_ms: Some(30_000),
      namespaces,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self, namespace: &str) -> Duration {
    Duration::from_millis(
      self
        .namespaces
        .get(namespace)
        .copied()
        .unwrap_or(DEFAULT_TTL_MS),
    )
  }

  pub fn fetch_timeout(&self) -> Option<Duration> {
    self.fetch_timeout_ms.map(Duration::from_millis)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/coachsync/store.db)
  pub path: Option<PathBuf>,
  pub max_bytes: Option<usize>,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_bytes: Some(5 * 1024 * 1024),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub base_url: Option<String>,
  /// Action tag to HTTP route
  pub routes: BTreeMap<String, Route>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// URL checked periodically to confirm the remote is reachable
  pub probe_url: Option<String>,
  pub probe_interval_ms: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_ms: 30_000,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_millis(self.probe_interval_ms.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./coachsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/coachsync/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("coachsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("coachsync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty document deserializes to unit, not to an empty map.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks COACHSYNC_API_KEY first, then SUPABASE_KEY as fallback.
  pub fn api_key() -> Option<String> {
    std::env::var("COACHSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_KEY"))
      .ok()
      .filter(|key| !key.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::HttpMethod;
  use std::io::Write;

  #[test]
  fn test_defaults_without_file_contents() {
    let config = Config::parse("").unwrap();
    assert_eq!(config.sync.max_retries, 3);
    assert_eq!(config.cache.capacity, 200);
    assert_eq!(config.cache.ttl("food"), Duration::from_secs(600));
    assert_eq!(config.cache.ttl("unlisted"), Duration::from_millis(DEFAULT_TTL_MS));
    assert!(config.remote.routes.is_empty());
    assert_eq!(config.cache.fetch_timeout(), Some(Duration::from_secs(30)));
    assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(30));
  }

  #[test]
  fn test_timeouts_and_probe_interval_from_file() {
    let yaml = r#"
cache:
  fetch_timeout_ms: null
connectivity:
  probe_url: https://example.supabase.co/rest/v1/
  probe_interval_ms: 5000
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.cache.fetch_timeout(), None);
    assert_eq!(config.connectivity.probe_interval(), Duration::from_secs(5));
    assert!(config.connectivity.probe_url.is_some());
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let yaml = r#"
sync:
  max_retries: 5
  safety_net_interval_ms: null
cache:
  namespaces:
    food: 1000
remote:
  base_url: https://example.supabase.co
  routes:
    create-record:
      method: POST
      path: /rest/v1/meals
    delete-record:
      method: DELETE
      path: /rest/v1/meals?id=eq.{id}
"#;
    let config = Config::parse(yaml).unwrap();

    let options = config.sync.options();
    assert_eq!(options.max_retries, 5);
    assert_eq!(options.drain_debounce, Duration::from_millis(250));
    assert_eq!(options.safety_net_interval, None);

    assert_eq!(config.cache.ttl("food"), Duration::from_secs(1));
    assert_eq!(config.cache.ttl("ai"), Duration::from_millis(DEFAULT_TTL_MS));
    assert_eq!(config.storage.max_bytes, Some(5 * 1024 * 1024));

    let delete = &config.remote.routes["delete-record"];
    assert_eq!(delete.method, HttpMethod::Delete);
    assert_eq!(delete.path, "/rest/v1/meals?id=eq.{id}");
  }

  #[test]
  fn test_explicit_path_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.yaml");
    assert!(Config::load(Some(&missing)).is_err());

    let path = dir.path().join("coachsync.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "cache:\n  capacity: 10").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache.capacity, 10);
  }

  #[test]
  fn test_invalid_yaml_is_reported_with_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(&path, "sync: [not, a, map]").unwrap();

    let err = Config::load(Some(&path)).unwrap_err();
    assert!(err.to_string().contains("bad.yaml"));
  }
}
