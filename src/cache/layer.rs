//! Cache layer that decides when entries are reloaded and dispatches loads.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::inflight::{InFlight, Ticket};
use super::keyspace::Keyspace;
use super::policy::TtlPolicy;
use super::storage::{MultiState, State};
use super::traits::{CacheResult, Loader};
use crate::config::StateCacheConfig;

/// Reason attached to writes made by `touch`
pub const TOUCH_REASON: &str = "Touching the state";

/// State cache for one resource type.
///
/// Sits between the application and a loader: `require` and `require_all`
/// only call the loader for entries that are stale (or when forced), while
/// `update_value`, `touch` and `clear_some` write the store directly.
///
/// A cache is meant to be built once per resource type and shared for the
/// lifetime of the application, typically behind an `Arc`.
pub struct StateCache<T, L>
where
  T: Clone + Send + Sync + 'static,
  L: Loader<T>,
{
  name: &'static str,
  states: Keyspace<T>,
  loader: L,
  policy: TtlPolicy,
  inflight: Option<InFlight<T>>,
}

impl<T, L> StateCache<T, L>
where
  T: Clone + Send + Sync + 'static,
  L: Loader<T>,
{
  /// Create a cache over `store` that loads through `loader`.
  ///
  /// The TTL and namespace are taken from `config` and fixed from here on.
  pub fn new(store: Arc<MultiState<T>>, loader: L, config: &StateCacheConfig) -> Self {
    let states = match &config.namespace {
      Some(ns) => Keyspace::namespaced(store, ns.clone()),
      None => Keyspace::new(store),
    };

    Self {
      name: "state_cache",
      states,
      loader,
      policy: TtlPolicy::new(config.ttl()),
      inflight: config.coalesce_requests.then(InFlight::new),
    }
  }

  /// Set the name used in log output.
  pub fn with_name(mut self, name: &'static str) -> Self {
    self.name = name;
    self
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn ttl(&self) -> Duration {
    self.policy.ttl()
  }

  pub fn keyspace(&self) -> &Keyspace<T> {
    &self.states
  }

  pub fn loader(&self) -> &L {
    &self.loader
  }

  /// Live handle for the entry of `key`.
  pub fn state(&self, key: &str) -> State<T> {
    self.states.get(key)
  }

  /// Re-write the current value to itself so subscribers re-evaluate.
  pub fn touch(&self, key: &str) {
    let state = self.states.get(key);
    state.put_value(state.value(), Some(TOUCH_REASON));
  }

  /// Push a value obtained outside the loader into the cache.
  pub fn update_value(&self, key: &str, value: T) {
    self.states.get(key).set(value);
  }

  /// Reset the given entries to pristine.
  pub fn clear_some<I, K>(&self, keys: I)
  where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
  {
    for key in keys {
      self.states.get(key.as_ref()).clear(None);
    }
  }

  /// Whether the entry of `key` is stale under this cache's TTL.
  pub fn is_stale(&self, key: &str) -> bool {
    self.policy.is_stale(&self.states.get(key).stamp())
  }

  /// Require the value of `key`, loading it when forced or stale.
  pub async fn require(&self, key: &str, force: bool) -> Result<T> {
    self.require_result(key, force).await.map(|result| result.data)
  }

  /// Like `require`, reporting where the value came from.
  pub async fn require_result(&self, key: &str, force: bool) -> Result<CacheResult<T>> {
    let state = self.states.get(key);

    if !force && !self.policy.is_stale(&state.stamp()) {
      if let Some(value) = state.value() {
        debug!(cache = self.name, key, "fresh");
        return Ok(CacheResult::from_cache(value, state.last_written_wall()));
      }
    }

    debug!(cache = self.name, key, force, "loading");

    let inflight = match &self.inflight {
      Some(inflight) if !force => inflight,
      _ => return self.load(&state, key).await.map(CacheResult::from_loader),
    };

    let store_key = self.states.store_key(key);
    match inflight.join(&store_key) {
      Ticket::Follower(rx) => {
        debug!(cache = self.name, key, "joining pending load");
        InFlight::wait(key, rx).await.map(CacheResult::coalesced)
      }
      Ticket::Leader(guard) => {
        let outcome = self.load(&state, key).await;
        guard.finish(&outcome);
        outcome.map(CacheResult::from_loader)
      }
    }
  }

  /// Require all `keys`, loading the stale ones (or all of them when
  /// forced) through a single batch call.
  ///
  /// Resolves without calling the loader when nothing needs loading.
  pub async fn require_all<K: AsRef<str>>(&self, keys: &[K], force: bool) -> Result<()> {
    let mut seen = HashSet::new();
    let to_load: Vec<String> = keys
      .iter()
      .map(AsRef::<str>::as_ref)
      .filter(|key| seen.insert(*key))
      .filter(|key| force || self.needs_load(&self.states.get(key)))
      .map(String::from)
      .collect();

    debug!(
      cache = self.name,
      requested = keys.len(),
      to_load = to_load.len(),
      force,
      "require all"
    );

    if to_load.is_empty() {
      return Ok(());
    }

    self
      .loader
      .load_all(&self.states, &to_load)
      .await
      .inspect_err(|err| {
        warn!(cache = self.name, keys = to_load.len(), error = %err, "batch load failed");
      })
  }

  /// Require all `keys` and read their values afterwards, in order.
  pub async fn require_values<K: AsRef<str>>(
    &self,
    keys: &[K],
    force: bool,
  ) -> Result<Vec<Option<T>>> {
    self.require_all(keys, force).await?;
    Ok(
      keys
        .iter()
        .map(|key| self.states.get(key.as_ref()).value())
        .collect(),
    )
  }

  // An entry written without a value (e.g. a touch on a pristine entry)
  // cannot satisfy a require, even while fresh.
  fn needs_load(&self, state: &State<T>) -> bool {
    self.policy.is_stale(&state.stamp()) || !state.has_value()
  }

  async fn load(&self, state: &State<T>, key: &str) -> Result<T> {
    let before = state.stamp();

    match self.loader.load(&self.states, key).await {
      Ok(value) => {
        if state.stamp() == before {
          warn!(cache = self.name, key, "loader resolved without writing the entry");
        }
        Ok(value)
      }
      Err(err) => {
        warn!(cache = self.name, key, error = %err, "load failed");
        Err(err)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::subscription::ChangeKind;
  use crate::cache::traits::CacheSource;
  use crate::error::CacheError;
  use async_trait::async_trait;
  use color_eyre::eyre::eyre;
  use parking_lot::Mutex;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use tokio::time::advance;

  /// Loader that serves values from a map and records every call.
  #[derive(Default)]
  struct RecordingLoader {
    values: Mutex<HashMap<String, String>>,
    loads: Mutex<Vec<String>>,
    batches: Mutex<Vec<Vec<String>>>,
    fail: AtomicBool,
    delay: Option<Duration>,
  }

  impl RecordingLoader {
    fn with_delay(delay: Duration) -> Self {
      Self {
        delay: Some(delay),
        ..Self::default()
      }
    }

    fn serve(&self, key: &str, value: &str) {
      self
        .values
        .lock()
        .insert(key.to_string(), value.to_string());
    }

    fn fail(&self, fail: bool) {
      self.fail.store(fail, Ordering::SeqCst);
    }

    fn loads(&self) -> Vec<String> {
      self.loads.lock().clone()
    }

    fn batches(&self) -> Vec<Vec<String>> {
      self.batches.lock().clone()
    }

    fn fetch(&self, key: &str) -> Result<String> {
      if self.fail.load(Ordering::SeqCst) {
        return Err(eyre!("remote unavailable"));
      }
      self
        .values
        .lock()
        .get(key)
        .cloned()
        .ok_or_else(|| eyre!("no such key: {}", key))
    }
  }

  #[async_trait]
  impl Loader<String> for RecordingLoader {
    async fn load(&self, states: &Keyspace<String>, key: &str) -> Result<String> {
      self.loads.lock().push(key.to_string());
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let value = self.fetch(key)?;
      states.get(key).put_value(Some(value.clone()), Some("loaded"));
      Ok(value)
    }

    async fn load_all(&self, states: &Keyspace<String>, keys: &[String]) -> Result<()> {
      self.batches.lock().push(keys.to_vec());
      let values = keys
        .iter()
        .map(|key| self.fetch(key))
        .collect::<Result<Vec<_>>>()?;
      for (key, value) in keys.iter().zip(values) {
        states.get(key).put_value(Some(value), Some("loaded"));
      }
      Ok(())
    }
  }

  fn cache(ttl: Duration) -> StateCache<String, RecordingLoader> {
    StateCache::new(
      Arc::new(MultiState::new()),
      RecordingLoader::default(),
      &StateCacheConfig::default().with_ttl(ttl),
    )
  }

  #[tokio::test]
  async fn test_update_then_require_skips_loader() {
    let cache = cache(Duration::from_secs(120));
    cache.update_value("a", "v".to_string());

    assert_eq!(cache.require("a", false).await.unwrap(), "v");
    assert!(cache.loader().loads().is_empty());
  }

  #[tokio::test]
  async fn test_clear_then_require_loads_once() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("a", "remote");
    cache.update_value("a", "local".to_string());
    cache.clear_some(["a"]);

    assert_eq!(cache.require("a", false).await.unwrap(), "remote");
    assert_eq!(cache.loader().loads(), vec!["a"]);

    assert_eq!(cache.require("a", false).await.unwrap(), "remote");
    assert_eq!(cache.loader().loads().len(), 1);
  }

  #[tokio::test]
  async fn test_force_always_loads() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("a", "remote");
    cache.update_value("a", "local".to_string());

    let result = cache.require_result("a", true).await.unwrap();
    assert_eq!(result.data, "remote");
    assert_eq!(result.source, CacheSource::Loaded);
    assert_eq!(cache.loader().loads(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_require_result_reports_cache_hit() {
    let cache = cache(Duration::from_secs(120));
    cache.update_value("a", "v".to_string());

    let result = cache.require_result("a", false).await.unwrap();
    assert!(result.is_cache_hit());
    assert!(result.cached_at.is_some());
  }

  #[tokio::test]
  async fn test_load_failure_propagates_and_leaves_state() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().fail(true);

    let err = cache.require("a", false).await.unwrap_err();
    assert_eq!(err.to_string(), "remote unavailable");
    assert!(cache.state("a").is_pristine());

    // Next call is judged stale again and retried
    cache.loader().fail(false);
    cache.loader().serve("a", "v");
    assert_eq!(cache.require("a", false).await.unwrap(), "v");
    assert_eq!(cache.loader().loads().len(), 2);
  }

  #[tokio::test]
  async fn test_require_all_loads_only_stale_keys() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("k2", "two");
    cache.update_value("k1", "one".to_string());

    cache.require_all(&["k1", "k2"], false).await.unwrap();

    assert_eq!(cache.loader().batches(), vec![vec!["k2".to_string()]]);
    assert_eq!(cache.state("k2").value().as_deref(), Some("two"));
  }

  #[tokio::test]
  async fn test_require_all_force_loads_everything() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("k1", "one");
    cache.loader().serve("k2", "two");
    cache.update_value("k1", "stale-one".to_string());

    cache.require_all(&["k1", "k2", "k1"], true).await.unwrap();

    assert_eq!(
      cache.loader().batches(),
      vec![vec!["k1".to_string(), "k2".to_string()]]
    );
    assert_eq!(cache.state("k1").value().as_deref(), Some("one"));
  }

  #[tokio::test]
  async fn test_require_all_empty_is_noop() {
    let cache = cache(Duration::from_secs(120));
    let keys: [&str; 0] = [];

    cache.require_all(&keys, false).await.unwrap();
    assert!(cache.loader().batches().is_empty());
  }

  #[tokio::test]
  async fn test_require_all_fresh_keys_is_noop() {
    let cache = cache(Duration::from_secs(120));
    cache.update_value("k1", "one".to_string());

    cache.require_all(&["k1"], false).await.unwrap();
    assert!(cache.loader().batches().is_empty());
  }

  #[tokio::test]
  async fn test_require_all_loads_fresh_empty_entries() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("k1", "one");
    cache.touch("k1");
    cache.update_value("k2", "two".to_string());
    assert!(!cache.is_stale("k1"));

    cache.require_all(&["k1", "k2"], false).await.unwrap();

    assert_eq!(cache.loader().batches(), vec![vec!["k1".to_string()]]);
    assert_eq!(cache.state("k1").value().as_deref(), Some("one"));
  }

  #[tokio::test]
  async fn test_require_all_failure_propagates() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().fail(true);

    let err = cache.require_all(&["k1", "k2"], false).await.unwrap_err();
    assert_eq!(err.to_string(), "remote unavailable");
    assert!(cache.state("k1").is_pristine());
    assert!(cache.state("k2").is_pristine());
  }

  #[tokio::test]
  async fn test_require_values_reads_in_order() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("k2", "two");
    cache.update_value("k1", "one".to_string());

    let values = cache.require_values(&["k2", "k1"], false).await.unwrap();
    assert_eq!(values, vec![Some("two".to_string()), Some("one".to_string())]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_touch_bumps_timestamp_and_keeps_value() {
    let cache = cache(Duration::from_secs(120));
    cache.update_value("a", "v".to_string());
    let state = cache.state("a");
    let before = state.last_written_at();
    let mut sub = state.subscribe();

    advance(Duration::from_millis(10)).await;
    cache.touch("a");

    assert!(state.last_written_at() > before);
    assert_eq!(state.value().as_deref(), Some("v"));

    let change = sub.try_recv().unwrap();
    assert_eq!(change.kind, ChangeKind::Written);
    assert_eq!(change.value.as_deref(), Some("v"));
    assert_eq!(change.reason.as_deref(), Some(TOUCH_REASON));
  }

  #[tokio::test]
  async fn test_touch_on_pristine_entry() {
    let cache = cache(Duration::from_secs(120));
    cache.loader().serve("a", "v");
    let mut sub = cache.state("a").subscribe();

    cache.touch("a");

    let state = cache.state("a");
    assert!(!state.is_pristine());
    assert!(!state.has_value());
    assert_eq!(sub.try_recv().map(|c| c.value), Some(None));

    // A fresh but empty entry still has to be loaded
    assert_eq!(cache.require("a", false).await.unwrap(), "v");
    assert_eq!(cache.loader().loads(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_clear_some_notifies_every_key() {
    let cache = cache(Duration::from_secs(120));
    cache.update_value("a", "1".to_string());
    let mut sub_a = cache.state("a").subscribe();
    let mut sub_b = cache.state("b").subscribe();

    cache.clear_some(["a", "b"]);

    assert_eq!(sub_a.try_recv().map(|c| c.kind), Some(ChangeKind::Cleared));
    assert_eq!(sub_b.try_recv().map(|c| c.kind), Some(ChangeKind::Cleared));
    assert!(cache.state("a").is_pristine());
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_boundary() {
    let cache = cache(Duration::from_millis(100));
    cache.update_value("a", "x".to_string());

    advance(Duration::from_millis(99)).await;
    assert!(!cache.is_stale("a"));
    advance(Duration::from_millis(1)).await;
    assert!(!cache.is_stale("a"));
    advance(Duration::from_millis(1)).await;
    assert!(cache.is_stale("a"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_expiry_scenario() {
    let cache = cache(Duration::from_millis(100));
    cache.update_value("a", "x".to_string());

    advance(Duration::from_millis(50)).await;
    assert_eq!(cache.require("a", false).await.unwrap(), "x");
    assert!(cache.loader().loads().is_empty());

    advance(Duration::from_millis(100)).await;
    cache.loader().serve("a", "y");
    assert_eq!(cache.require("a", false).await.unwrap(), "y");
    assert_eq!(cache.loader().loads(), vec!["a"]);

    advance(Duration::from_millis(10)).await;
    assert_eq!(cache.require("a", false).await.unwrap(), "y");
    assert_eq!(cache.loader().loads().len(), 1);
  }

  #[tokio::test]
  async fn test_namespaced_caches_share_store() {
    let store = Arc::new(MultiState::new());
    let users = StateCache::new(
      Arc::clone(&store),
      RecordingLoader::default(),
      &StateCacheConfig {
        namespace: Some("users".to_string()),
        ..StateCacheConfig::default()
      },
    );
    let projects = StateCache::new(
      Arc::clone(&store),
      RecordingLoader::default(),
      &StateCacheConfig {
        namespace: Some("projects".to_string()),
        ..StateCacheConfig::default()
      },
    );
    users.loader().serve("1", "alice");
    projects.loader().serve("1", "apollo");

    assert_eq!(users.require("1", false).await.unwrap(), "alice");
    assert_eq!(projects.require("1", false).await.unwrap(), "apollo");
    assert_eq!(store.get("users:1").value().as_deref(), Some("alice"));
    assert_eq!(store.get("projects:1").value().as_deref(), Some("apollo"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_requires_load_twice_without_coalescing() {
    let cache = StateCache::new(
      Arc::new(MultiState::new()),
      RecordingLoader::with_delay(Duration::from_millis(10)),
      &StateCacheConfig::default(),
    );
    cache.loader().serve("a", "v");

    let (first, second) = tokio::join!(cache.require("a", false), cache.require("a", false));

    assert_eq!(first.unwrap(), "v");
    assert_eq!(second.unwrap(), "v");
    assert_eq!(cache.loader().loads().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_requires_coalesce() {
    let cache = StateCache::new(
      Arc::new(MultiState::new()),
      RecordingLoader::with_delay(Duration::from_millis(10)),
      &StateCacheConfig {
        coalesce_requests: true,
        ..StateCacheConfig::default()
      },
    );
    cache.loader().serve("a", "v");

    let (first, second) = tokio::join!(
      cache.require_result("a", false),
      cache.require_result("a", false)
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.source, CacheSource::Loaded);
    assert_eq!(second.source, CacheSource::Coalesced);
    assert_eq!(second.data, "v");
    assert_eq!(cache.loader().loads().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_coalesced_failure_reaches_followers() {
    let cache = StateCache::new(
      Arc::new(MultiState::new()),
      RecordingLoader::with_delay(Duration::from_millis(10)),
      &StateCacheConfig {
        coalesce_requests: true,
        ..StateCacheConfig::default()
      },
    );
    cache.loader().fail(true);

    let (first, second) = tokio::join!(cache.require("a", false), cache.require("a", false));

    assert_eq!(first.unwrap_err().to_string(), "remote unavailable");
    assert!(matches!(
      second.unwrap_err().downcast_ref::<CacheError>(),
      Some(CacheError::SharedLoadFailed { .. })
    ));
    assert_eq!(cache.loader().loads().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_forced_require_is_not_coalesced() {
    let cache = StateCache::new(
      Arc::new(MultiState::new()),
      RecordingLoader::with_delay(Duration::from_millis(10)),
      &StateCacheConfig {
        coalesce_requests: true,
        ..StateCacheConfig::default()
      },
    );
    cache.loader().serve("a", "v");

    let (first, second) = tokio::join!(cache.require("a", false), cache.require("a", true));

    assert_eq!(first.unwrap(), "v");
    assert_eq!(second.unwrap(), "v");
    assert_eq!(cache.loader().loads().len(), 2);
  }
}
