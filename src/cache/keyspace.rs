//! Namespaced view over a shared store.
//!
//! Several caches may share one `MultiState` as long as their keys do not
//! collide. A keyspace prefixes every key with its namespace, so the caches
//! (and their loaders) keep addressing entries by their own short keys.

use std::borrow::Cow;
use std::sync::Arc;

use super::storage::{MultiState, State};

/// Separator between namespace and key in store keys
pub const NAMESPACE_SEPARATOR: char = ':';

pub struct Keyspace<T> {
  store: Arc<MultiState<T>>,
  namespace: Option<String>,
}

impl<T: Clone> Keyspace<T> {
  /// Address keys in `store` verbatim.
  pub fn new(store: Arc<MultiState<T>>) -> Self {
    Self {
      store,
      namespace: None,
    }
  }

  /// Address keys in `store` under `namespace`.
  pub fn namespaced(store: Arc<MultiState<T>>, namespace: impl Into<String>) -> Self {
    Self {
      store,
      namespace: Some(namespace.into()),
    }
  }

  pub fn namespace(&self) -> Option<&str> {
    self.namespace.as_deref()
  }

  /// The shared store behind this view.
  pub fn store(&self) -> &Arc<MultiState<T>> {
    &self.store
  }

  /// Get-or-create the entry for `key` in this namespace.
  pub fn get(&self, key: &str) -> State<T> {
    self.store.get(&self.store_key(key))
  }

  /// Whether `key` has been addressed in this namespace.
  pub fn contains(&self, key: &str) -> bool {
    self.store.contains(&self.store_key(key))
  }

  /// Keys of this namespace that exist in the store, without the prefix.
  pub fn keys(&self) -> Vec<String> {
    self
      .store
      .keys()
      .into_iter()
      .filter_map(|key| self.local_key(&key).map(String::from))
      .collect()
  }

  /// Full store key for `key`.
  pub fn store_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
    match &self.namespace {
      Some(ns) => Cow::Owned(format!("{}{}{}", ns, NAMESPACE_SEPARATOR, key)),
      None => Cow::Borrowed(key),
    }
  }

  /// Strip this namespace from a store key. Returns None for keys of other
  /// namespaces.
  pub fn local_key<'a>(&self, store_key: &'a str) -> Option<&'a str> {
    match &self.namespace {
      Some(ns) => store_key
        .strip_prefix(ns.as_str())
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR)),
      None => Some(store_key),
    }
  }
}

impl<T> Clone for Keyspace<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      namespace: self.namespace.clone(),
    }
  }
}
