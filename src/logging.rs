//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::CacheError;

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default level (trace, debug, info, warn, error); RUST_LOG takes precedence
  #[serde(default = "default_level")]
  pub level: String,
  /// Write to daily-rotated files in this directory instead of stderr
  #[serde(default)]
  pub log_dir: Option<PathBuf>,
  #[serde(default = "default_file_name")]
  pub file_name: String,
}

fn default_level() -> String {
  "info".to_string()
}

fn default_file_name() -> String {
  "statecache.log".to_string()
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      log_dir: None,
      file_name: default_file_name(),
    }
  }
}

/// Keeps the background log writer alive. Drop it only at shutdown, or
/// buffered lines are lost.
pub struct LogGuard {
  _guard: Option<WorkerGuard>,
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init(config: &LogConfig) -> Result<LogGuard> {
  let filter = env_filter(config)?;

  let guard = match &config.log_dir {
    Some(dir) => {
      let (subscriber, guard) = file_subscriber(filter, dir, &config.file_name);
      subscriber
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      None
    }
  };

  tracing::debug!(
    level = %config.level,
    file_output = config.log_dir.is_some(),
    "logging initialized"
  );

  Ok(LogGuard { _guard: guard })
}

/// Subscriber writing plain-text lines to a daily-rotated file in `dir`.
fn file_subscriber(
  filter: EnvFilter,
  dir: &Path,
  file_name: &str,
) -> (impl Subscriber + Send + Sync + 'static, WorkerGuard) {
  let appender = tracing_appender::rolling::daily(dir, file_name);
  let (writer, guard) = tracing_appender::non_blocking(appender);
  let subscriber = tracing_subscriber::registry().with(filter).with(
    tracing_subscriber::fmt::layer()
      .with_writer(writer)
      .with_ansi(false),
  );
  (subscriber, guard)
}

fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
  let level = parse_level(&config.level)?;
  Ok(
    EnvFilter::builder()
      .with_default_directive(level.into())
      .from_env_lossy(),
  )
}

fn parse_level(level: &str) -> Result<Level, CacheError> {
  match level.to_lowercase().as_str() {
    "trace" => Ok(Level::TRACE),
    "debug" => Ok(Level::DEBUG),
    "info" => Ok(Level::INFO),
    "warn" => Ok(Level::WARN),
    "error" => Ok(Level::ERROR),
    _ => Err(CacheError::InvalidLogLevel(level.to_string())),
  }
}
