//! Staleness policy deciding when an entry must be reloaded.

use std::time::Duration;
use tokio::time::Instant;

use super::traits::EntryStamp;

/// Default time a written value is trusted without reload
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// TTL-based staleness.
///
/// An entry is stale when it is pristine, or when its last write is strictly
/// older than the TTL. A value written exactly `ttl` ago is still fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
  ttl: Duration,
}

impl TtlPolicy {
  pub fn new(ttl: Duration) -> Self {
    Self { ttl }
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Check staleness against the current time.
  pub fn is_stale(&self, stamp: &EntryStamp) -> bool {
    self.is_stale_at(stamp, Instant::now())
  }

  /// Check staleness as of `now`.
  pub fn is_stale_at(&self, stamp: &EntryStamp, now: Instant) -> bool {
    if stamp.pristine {
      return true;
    }
    match stamp.written_at {
      Some(at) => now.saturating_duration_since(at) > self.ttl,
      None => true,
    }
  }
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self::new(DEFAULT_TTL)
  }
}
