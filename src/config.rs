use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogConfig;

/// Environment variable overriding the default TTL, in seconds
pub const TTL_ENV_VAR: &str = "STATECACHE_TTL_SECONDS";

/// Construction-time settings of a single state cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StateCacheConfig {
  /// How long a written value is trusted without reload
  #[serde(default = "default_ttl_seconds")]
  pub ttl_seconds: u64,
  /// Sub-second TTL; takes precedence over `ttl_seconds` when set
  #[serde(default)]
  pub ttl_millis: Option<u64>,
  /// Let concurrent requires for the same key share one load
  #[serde(default)]
  pub coalesce_requests: bool,
  /// Key prefix when several caches share one store
  #[serde(default)]
  pub namespace: Option<String>,
}

fn default_ttl_seconds() -> u64 {
  120
}

impl Default for StateCacheConfig {
  fn default() -> Self {
    Self {
      ttl_seconds: default_ttl_seconds(),
      ttl_millis: None,
      coalesce_requests: false,
      namespace: None,
    }
  }
}

impl StateCacheConfig {
  pub fn ttl(&self) -> Duration {
    match self.ttl_millis {
      Some(ms) => Duration::from_millis(ms),
      None => Duration::from_secs(self.ttl_seconds),
    }
  }

  /// Use an exact TTL, down to the millisecond. TTLs beyond `u64::MAX`
  /// milliseconds saturate.
  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl_seconds = ttl.as_secs();
    self.ttl_millis = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
    self
  }

  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = Some(namespace.into());
    self
  }
}

/// Per-cache entry of a settings file. Unset fields inherit from
/// `Settings::defaults`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CacheOverrides {
  #[serde(default)]
  pub ttl_seconds: Option<u64>,
  #[serde(default)]
  pub ttl_millis: Option<u64>,
  #[serde(default)]
  pub coalesce_requests: Option<bool>,
  #[serde(default)]
  pub namespace: Option<String>,
}

/// File configuration for all caches of an application.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
  /// Base settings every named cache starts from
  #[serde(default)]
  pub defaults: StateCacheConfig,
  /// Per-cache overrides, by cache name (e.g. "users", "projects")
  #[serde(default)]
  pub caches: BTreeMap<String, CacheOverrides>,
  #[serde(default)]
  pub logging: LogConfig,
}

impl Settings {
  /// Locate and read the settings file.
  ///
  /// An explicit path must exist. Otherwise `statecache.yaml` in the working
  /// directory is tried, then `statecache/config.yaml` under the user config
  /// directory; when neither exists the built-in defaults apply.
  /// `STATECACHE_TTL_SECONDS` then replaces the default TTL.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let settings = match Self::resolve_path(explicit_path)? {
      Some(path) => Self::read(&path)?,
      None => Self::default(),
    };

    settings.with_env_overrides()
  }

  fn resolve_path(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("statecache settings {} do not exist", path.display()));
      }
      return Ok(Some(path.to_path_buf()));
    }

    let mut candidates = vec![PathBuf::from("statecache.yaml")];
    if let Some(dir) = dirs::config_dir() {
      candidates.push(dir.join("statecache").join("config.yaml"));
    }
    Ok(candidates.into_iter().find(|path| path.is_file()))
  }

  fn read(path: &Path) -> Result<Self> {
    let yaml = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Cannot read statecache settings {}: {}", path.display(), e))?;

    Self::parse(&yaml)
      .map_err(|e| eyre!("Invalid statecache settings in {}: {}", path.display(), e))
  }

  /// Parse settings from YAML text.
  pub fn parse(yaml: &str) -> Result<Self> {
    // An empty document deserializes as unit, not as an empty map
    if yaml.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(yaml)?)
  }

  fn with_env_overrides(self) -> Result<Self> {
    match std::env::var(TTL_ENV_VAR) {
      Ok(raw) => self.with_default_ttl_override(&raw),
      Err(_) => Ok(self),
    }
  }

  fn with_default_ttl_override(mut self, raw: &str) -> Result<Self> {
    let seconds: u64 = raw
      .trim()
      .parse()
      .map_err(|e| eyre!("{} must be a whole number of seconds, got '{}': {}", TTL_ENV_VAR, raw, e))?;
    self.defaults.ttl_seconds = seconds;
    self.defaults.ttl_millis = None;
    Ok(self)
  }

  /// Settings for the cache called `name`: `defaults` with the cache's own
  /// entry layered on top.
  ///
  /// The namespace is the cache name unless the entry sets one, so named
  /// caches sharing one store never collide.
  pub fn for_cache(&self, name: &str) -> StateCacheConfig {
    let mut config = StateCacheConfig {
      namespace: Some(name.to_string()),
      ..self.defaults.clone()
    };

    let Some(overrides) = self.caches.get(name) else {
      return config;
    };

    match (overrides.ttl_millis, overrides.ttl_seconds) {
      (Some(ms), _) => {
        config.ttl_millis = Some(ms);
        config.ttl_seconds = ms / 1000;
      }
      (None, Some(seconds)) => {
        config.ttl_seconds = seconds;
        config.ttl_millis = None;
      }
      (None, None) => {}
    }
    if let Some(coalesce) = overrides.coalesce_requests {
      config.coalesce_requests = coalesce;
    }
    if let Some(namespace) = &overrides.namespace {
      config.namespace = Some(namespace.clone());
    }
    config
  }
}
