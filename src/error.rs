use thiserror::Error;

/// Errors raised by the cache itself.
///
/// Loader failures are not wrapped in this type; they reach the caller of
/// `require` as the loader returned them.
#[derive(Debug, Error)]
pub enum CacheError {
  /// The load this caller was waiting on was dropped before it finished
  #[error("load for '{key}' was abandoned before completing")]
  LoadAbandoned { key: String },

  /// The load this caller was waiting on failed
  #[error("load for '{key}' failed: {message}")]
  SharedLoadFailed { key: String, message: String },

  #[error("invalid log level: {0}")]
  InvalidLogLevel(String),
}
