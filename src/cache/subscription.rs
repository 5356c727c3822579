//! Change notifications for cache entries.

use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::storage::StateInner;

/// What happened to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
  /// A value (possibly absent) was written
  Written,
  /// The entry was reset to pristine
  Cleared,
}

/// A single change notification, delivered to every subscriber of the entry.
#[derive(Debug, Clone)]
pub struct StateChange<T> {
  /// Store key of the entry (including any namespace prefix)
  pub key: String,
  pub kind: ChangeKind,
  /// Value after the change
  pub value: Option<T>,
  /// Optional human-readable reason passed by the writer
  pub reason: Option<String>,
}

/// Receiving end of an entry subscription.
///
/// Changes are queued without bound and never block the writer. Dropping
/// the subscription detaches it from the entry.
pub struct Subscription<T> {
  id: u64,
  state: Weak<StateInner<T>>,
  rx: mpsc::UnboundedReceiver<StateChange<T>>,
  attached: bool,
}

impl<T> Subscription<T> {
  pub(super) fn new(
    id: u64,
    state: Weak<StateInner<T>>,
    rx: mpsc::UnboundedReceiver<StateChange<T>>,
  ) -> Self {
    Self {
      id,
      state,
      rx,
      attached: true,
    }
  }

  /// Wait for the next change.
  ///
  /// Returns `None` once the subscription was cancelled and every queued
  /// change has been received.
  pub async fn recv(&mut self) -> Option<StateChange<T>> {
    self.rx.recv().await
  }

  /// Take the next queued change without waiting.
  pub fn try_recv(&mut self) -> Option<StateChange<T>> {
    self.rx.try_recv().ok()
  }

  /// Stop receiving changes. Calling this more than once is a no-op.
  ///
  /// Changes queued before the call can still be drained.
  pub fn unsubscribe(&mut self) {
    if !self.attached {
      return;
    }
    self.attached = false;
    if let Some(state) = self.state.upgrade() {
      state.detach(self.id);
    }
    self.rx.close();
  }

  pub fn is_active(&self) -> bool {
    self.attached && !self.rx.is_closed()
  }

  /// Stream of the present values written to the entry, skipping clears and
  /// writes of an absent value.
  pub fn values(self) -> impl Stream<Item = T>
  where
    T: Send + 'static,
  {
    self.filter_map(|change| async move {
      match change.kind {
        ChangeKind::Written => change.value,
        ChangeKind::Cleared => None,
      }
    })
  }
}

impl<T> Stream for Subscription<T> {
  type Item = StateChange<T>;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}

impl<T> Drop for Subscription<T> {
  fn drop(&mut self) {
    self.unsubscribe();
  }
}

impl<T> std::fmt::Debug for Subscription<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("id", &self.id)
      .field("attached", &self.attached)
      .finish_non_exhaustive()
  }
}
