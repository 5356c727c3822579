//! Keyed TTL state cache.
//!
//! This module provides a resource-agnostic caching mechanism that:
//! - Keeps one reactive entry per key, created lazily and observable by subscribers
//! - Treats entries as stale when never written or older than a TTL
//! - Loads single keys or batches through a pluggable `Loader` only when stale
//! - Lets several caches share one store through namespaced keyspaces

mod inflight;
mod keyspace;
mod layer;
mod policy;
mod storage;
mod subscription;
mod traits;

pub use keyspace::{Keyspace, NAMESPACE_SEPARATOR};
pub use layer::{StateCache, TOUCH_REASON};
pub use policy::{TtlPolicy, DEFAULT_TTL};
pub use storage::{MultiState, State};
pub use subscription::{ChangeKind, StateChange, Subscription};
pub use traits::{CacheEntry, CacheResult, CacheSource, EntryStamp, Loader};
