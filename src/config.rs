use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::entity::EntityKind;
use crate::error::ConfigurationError;
use crate::sync::RefreshPriority;

const APP_DIR: &str = "ledger-cache";
const LOCAL_CONFIG: &str = "ledger-cache.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub preload: PreloadConfig,
  pub pagination: PaginationConfig,
  pub sync: SyncConfig,
  pub logging: LoggingConfig,
  pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL applied when a caller does not pass one
  pub default_ttl_ms: u64,
  /// Entry ceiling; least-recently-accessed entries are evicted beyond it
  pub max_entries: Option<usize>,
  /// Approximate byte ceiling across all entries
  pub max_memory_bytes: Option<usize>,
  /// How often the janitor sweeps expired entries
  pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 5 * 60 * 1000,
      max_entries: Some(1_000),
      max_memory_bytes: Some(16 * 1024 * 1024),
      cleanup_interval_ms: 60 * 1000,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_millis(self.cleanup_interval_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloadConfig {
  /// Background fetches allowed in flight at once
  pub concurrency: usize,
  /// Extra attempts for a failed background fetch (0 = log and drop)
  pub max_retries: u32,
  pub retry_backoff_ms: u64,
}

impl Default for PreloadConfig {
  fn default() -> Self {
    Self {
      concurrency: 2,
      max_retries: 0,
      retry_backoff_ms: 250,
    }
  }
}

impl PreloadConfig {
  pub fn retry_backoff(&self) -> Duration {
    Duration::from_millis(self.retry_backoff_ms)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
  pub default_page_size: u64,
  pub max_page_size: u64,
}

impl Default for PaginationConfig {
  fn default() -> Self {
    Self {
      default_page_size: 20,
      max_page_size: 200,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Start the auto-sync coordinator with the application
  pub enabled: bool,
  /// Finished sync tasks kept for diagnostics
  pub history_limit: usize,
  /// Additional invalidation rules on top of the built-in table
  pub extra_rules: Vec<SyncRuleConfig>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      history_limit: 50,
      extra_rules: Vec::new(),
    }
  }
}

/// One extra row of the invalidation table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRuleConfig {
  pub entity: EntityKind,
  /// Key prefix invalidated when `entity` changes (e.g. "reports:")
  pub prefix: String,
  #[serde(default)]
  pub refresh: RefreshPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive when LEDGER_CACHE_LOG is not set
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Simulated round-trip latency of the in-memory backend
  pub latency_ms: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self { latency_ms: 25 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./ledger-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledger-cache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
    let local = PathBuf::from(LOCAL_CONFIG);
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn to_yaml(&self) -> Result<String> {
    Ok(serde_yaml::to_string(self)?)
  }

  /// Reject values that have no safe default.
  pub fn validate(&self) -> Result<(), ConfigurationError> {
    if self.preload.concurrency == 0 {
      return Err(ConfigurationError::Invalid(
        "preload.concurrency must be at least 1".into(),
      ));
    }
    if self.pagination.default_page_size == 0 || self.pagination.max_page_size == 0 {
      return Err(ConfigurationError::Invalid(
        "pagination page sizes must be positive".into(),
      ));
    }
    if self.pagination.default_page_size > self.pagination.max_page_size {
      return Err(ConfigurationError::Invalid(format!(
        "pagination.default_page_size ({}) exceeds max_page_size ({})",
        self.pagination.default_page_size, self.pagination.max_page_size
      )));
    }
    if self.cache.max_entries == Some(0) {
      return Err(ConfigurationError::Invalid(
        "cache.max_entries must be positive when set".into(),
      ));
    }
    if self.cache.cleanup_interval_ms == 0 {
      return Err(ConfigurationError::Invalid(
        "cache.cleanup_interval_ms must be positive".into(),
      ));
    }
    if let Some(rule) = self.sync.extra_rules.iter().find(|r| r.prefix.is_empty()) {
      return Err(ConfigurationError::Invalid(format!(
        "sync rule for {} has an empty prefix",
        rule.entity
      )));
    }
    Ok(())
  }
}
