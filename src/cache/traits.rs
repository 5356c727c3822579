//! Core traits and types for the caching system.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use tokio::time::Instant;

use super::keyspace::Keyspace;

/// Fetches values from a remote source and writes them into the cache.
///
/// Implementors are the only place where I/O happens. Both operations must
/// write their results through the `Keyspace` they are handed before
/// resolving; the cache never writes a loaded value on the loader's behalf.
#[async_trait]
pub trait Loader<T>: Send + Sync
where
  T: Clone + Send + Sync + 'static,
{
  /// Load a single value, write it into `states` and return it.
  ///
  /// On failure, return the error and leave the entry untouched.
  async fn load(&self, states: &Keyspace<T>, key: &str) -> Result<T>;

  /// Load a batch of values and write each of them into `states`.
  ///
  /// Resolve only after every write for the batch is committed, or fail
  /// if the batch as a whole cannot be fulfilled.
  async fn load_all(&self, states: &Keyspace<T>, keys: &[String]) -> Result<()>;
}

/// Freshness metadata of one entry, without its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStamp {
  /// Never written since creation or since the last clear
  pub pristine: bool,
  /// When the entry was last written (None while pristine)
  pub written_at: Option<Instant>,
  /// Bumped on every write and clear
  pub version: u64,
}

impl EntryStamp {
  /// Stamp of an entry that has never been written.
  pub fn pristine() -> Self {
    Self {
      pristine: true,
      written_at: None,
      version: 0,
    }
  }

  /// Stamp of an entry written at `at`.
  pub fn written(at: Instant) -> Self {
    Self {
      pristine: false,
      written_at: Some(at),
      version: 1,
    }
  }
}

/// Point-in-time copy of a cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: Option<T>,
  pub stamp: EntryStamp,
  /// Wall-clock time of the last write, for display
  pub written_wall: Option<DateTime<Utc>>,
}

impl<T> CacheEntry<T> {
  pub fn is_pristine(&self) -> bool {
    self.stamp.pristine
  }

  pub fn last_written_at(&self) -> Option<Instant> {
    self.stamp.written_at
  }
}

/// Result from a require operation, including where the value came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the served value was written (if served from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Value produced by a loader call made for this request.
  pub fn from_loader(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Loaded,
      cached_at: None,
    }
  }

  /// Value served from a fresh entry.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Value produced by a loader call another caller started.
  pub fn coalesced(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Coalesced,
      cached_at: None,
    }
  }

  pub fn is_cache_hit(&self) -> bool {
    self.source == CacheSource::CacheFresh
  }
}

/// Indicates where required data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh entry, no loader involved
  CacheFresh,
  /// Loaded by this call
  Loaded,
  /// Loaded by a concurrent call for the same key
  Coalesced,
}
