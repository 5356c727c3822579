//! TTL state caches for client applications.
//!
//! A [`StateCache`] sits between an application and a remote source. Values
//! live in a shared [`MultiState`] store whose entries notify subscribers on
//! every write; the cache decides per key whether the stored value is still
//! fresh and calls its [`Loader`] only for the keys that are not.
//!
//! ```ignore
//! let store = Arc::new(MultiState::new());
//! let settings = Settings::load(None)?;
//! let users = StateCache::new(Arc::clone(&store), UserLoader::new(api), &settings.for_cache("users"))
//!   .with_name("users");
//!
//! let alice = users.require("alice", false).await?;
//! users.require_all(&["bob", "carol"], false).await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;

pub use cache::{
  CacheEntry, CacheResult, CacheSource, ChangeKind, EntryStamp, Keyspace, Loader, MultiState,
  State, StateCache, StateChange, Subscription, TtlPolicy,
};
pub use config::{CacheOverrides, Settings, StateCacheConfig};
pub use error::CacheError;
