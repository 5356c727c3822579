//! Reactive entry store: keyed, lazily created entries that notify
//! subscribers on every write.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::subscription::{ChangeKind, StateChange, Subscription};
use super::traits::{CacheEntry, EntryStamp};

/// Mutable part of an entry, guarded by the entry lock.
struct Slot<T> {
  value: Option<T>,
  stamp: EntryStamp,
  written_wall: Option<DateTime<Utc>>,
  subscribers: Vec<(u64, mpsc::UnboundedSender<StateChange<T>>)>,
}

pub(crate) struct StateInner<T> {
  key: String,
  slot: Mutex<Slot<T>>,
  next_subscriber: AtomicU64,
}

impl<T> StateInner<T> {
  pub(super) fn detach(&self, id: u64) {
    self.slot.lock().subscribers.retain(|(sub, _)| *sub != id);
  }
}

/// Handle to a single entry.
///
/// Handles are cheap to clone; every clone addresses the same entry.
pub struct State<T> {
  inner: Arc<StateInner<T>>,
}

impl<T> Clone for State<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T: Clone> State<T> {
  fn new(key: String) -> Self {
    Self {
      inner: Arc::new(StateInner {
        key,
        slot: Mutex::new(Slot {
          value: None,
          stamp: EntryStamp::pristine(),
          written_wall: None,
          subscribers: Vec::new(),
        }),
        next_subscriber: AtomicU64::new(0),
      }),
    }
  }

  pub fn key(&self) -> &str {
    &self.inner.key
  }

  /// Current value, if any.
  pub fn value(&self) -> Option<T> {
    self.inner.slot.lock().value.clone()
  }

  pub fn has_value(&self) -> bool {
    self.inner.slot.lock().value.is_some()
  }

  pub fn is_pristine(&self) -> bool {
    self.inner.slot.lock().stamp.pristine
  }

  pub fn stamp(&self) -> EntryStamp {
    self.inner.slot.lock().stamp
  }

  pub fn last_written_at(&self) -> Option<Instant> {
    self.inner.slot.lock().stamp.written_at
  }

  pub fn last_written_wall(&self) -> Option<DateTime<Utc>> {
    self.inner.slot.lock().written_wall
  }

  /// Whether the last write happened more than `age` ago.
  ///
  /// A pristine entry has no age and is never older than anything.
  pub fn is_older_than(&self, age: Duration) -> bool {
    match self.last_written_at() {
      Some(at) => Instant::now().saturating_duration_since(at) > age,
      None => false,
    }
  }

  pub fn snapshot(&self) -> CacheEntry<T> {
    let slot = self.inner.slot.lock();
    CacheEntry {
      key: self.inner.key.clone(),
      value: slot.value.clone(),
      stamp: slot.stamp,
      written_wall: slot.written_wall,
    }
  }

  /// Write `value` (which may be absent), stamp it and notify subscribers.
  pub fn put_value(&self, value: Option<T>, reason: Option<&str>) {
    let mut slot = self.inner.slot.lock();
    let now = Instant::now();
    // Keep timestamps monotonic per entry
    let at = slot.stamp.written_at.map_or(now, |prev| prev.max(now));
    slot.value = value;
    slot.stamp = EntryStamp {
      pristine: false,
      written_at: Some(at),
      version: slot.stamp.version + 1,
    };
    slot.written_wall = Some(Utc::now());
    trace!(key = %self.inner.key, version = slot.stamp.version, reason, "state written");
    self.notify(&mut slot, ChangeKind::Written, reason);
  }

  /// Write a present value without a reason.
  pub fn set(&self, value: T) {
    self.put_value(Some(value), None);
  }

  /// Reset the entry to pristine, dropping its value, and notify subscribers.
  pub fn clear(&self, reason: Option<&str>) {
    let mut slot = self.inner.slot.lock();
    slot.value = None;
    slot.stamp = EntryStamp {
      pristine: true,
      written_at: None,
      version: slot.stamp.version + 1,
    };
    slot.written_wall = None;
    trace!(key = %self.inner.key, reason, "state cleared");
    self.notify(&mut slot, ChangeKind::Cleared, reason);
  }

  /// Subscribe to every future change of this entry.
  pub fn subscribe(&self) -> Subscription<T> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
    self.inner.slot.lock().subscribers.push((id, tx));
    Subscription::new(id, Arc::downgrade(&self.inner), rx)
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.slot.lock().subscribers.len()
  }

  /// Close every subscriber channel of this entry.
  fn stop_subscriptions(&self) -> usize {
    let mut slot = self.inner.slot.lock();
    let count = slot.subscribers.len();
    slot.subscribers.clear();
    count
  }

  fn notify(&self, slot: &mut Slot<T>, kind: ChangeKind, reason: Option<&str>) {
    if slot.subscribers.is_empty() {
      return;
    }

    let change = StateChange {
      key: self.inner.key.clone(),
      kind,
      value: slot.value.clone(),
      reason: reason.map(String::from),
    };

    let before = slot.subscribers.len();
    slot
      .subscribers
      .retain(|(_, tx)| tx.send(change.clone()).is_ok());

    let pruned = before - slot.subscribers.len();
    if pruned > 0 {
      debug!(key = %self.inner.key, pruned, "dropped closed subscribers");
    }
  }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for State<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let slot = self.inner.slot.lock();
    f.debug_struct("State")
      .field("key", &self.inner.key)
      .field("value", &slot.value)
      .field("stamp", &slot.stamp)
      .finish_non_exhaustive()
  }
}

/// Keyed collection of entries.
///
/// Entries are created pristine the first time a key is addressed and are
/// never removed; clearing an entry returns it to pristine instead.
pub struct MultiState<T> {
  states: Mutex<HashMap<String, State<T>>>,
}

impl<T: Clone> MultiState<T> {
  pub fn new() -> Self {
    Self {
      states: Mutex::new(HashMap::new()),
    }
  }

  /// Get the entry for `key`, creating it if it does not exist yet.
  pub fn get(&self, key: &str) -> State<T> {
    let mut states = self.states.lock();
    if let Some(state) = states.get(key) {
      return state.clone();
    }
    let state = State::new(key.to_string());
    states.insert(key.to_string(), state.clone());
    state
  }

  pub fn contains(&self, key: &str) -> bool {
    self.states.lock().contains_key(key)
  }

  pub fn keys(&self) -> Vec<String> {
    self.states.lock().keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.states.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.states.lock().is_empty()
  }

  /// Clear every entry.
  pub fn clear_all(&self, reason: Option<&str>) {
    for state in self.handles() {
      state.clear(reason);
    }
  }

  /// Close all subscriptions on all entries. Entries keep their values and
  /// accept new subscribers afterwards.
  pub fn stop_all_subscriptions(&self) {
    let stopped: usize = self.handles().iter().map(State::stop_subscriptions).sum();
    debug!(stopped, "stopped all subscriptions");
  }

  // Handles are collected first so no entry lock is taken under the map lock.
  fn handles(&self) -> Vec<State<T>> {
    self.states.lock().values().cloned().collect()
  }
}

impl<T: Clone> Default for MultiState<T> {
  fn default() -> Self {
    Self::new()
  }
}
