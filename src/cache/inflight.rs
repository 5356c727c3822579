//! In-flight load tracking used to coalesce concurrent requires for a key.

use color_eyre::{Report, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::CacheError;

type Outcome<T> = Option<Result<T, Arc<str>>>;

/// Pending loads by store key.
pub(crate) struct InFlight<T> {
  pending: Mutex<HashMap<String, watch::Receiver<Outcome<T>>>>,
}

/// Role of a caller for one key.
pub(crate) enum Ticket<'a, T> {
  /// No load was pending; this caller must load and publish the outcome.
  Leader(LeaderGuard<'a, T>),
  /// A load is pending; wait for it.
  Follower(watch::Receiver<Outcome<T>>),
}

impl<T: Clone> InFlight<T> {
  pub(crate) fn new() -> Self {
    Self {
      pending: Mutex::new(HashMap::new()),
    }
  }

  pub(crate) fn join(&self, key: &str) -> Ticket<'_, T> {
    let mut pending = self.pending.lock();
    if let Some(rx) = pending.get(key) {
      return Ticket::Follower(rx.clone());
    }

    let (tx, rx) = watch::channel(None);
    pending.insert(key.to_string(), rx);
    Ticket::Leader(LeaderGuard {
      key: key.to_string(),
      tx,
      owner: self,
    })
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.pending.lock().len()
  }

  /// Wait for the leader's outcome.
  pub(crate) async fn wait(key: &str, mut rx: watch::Receiver<Outcome<T>>) -> Result<T> {
    let outcome = match rx.wait_for(Option::is_some).await {
      Ok(outcome) => (*outcome).clone(),
      Err(_) => None,
    };

    match outcome {
      Some(Ok(value)) => Ok(value),
      Some(Err(message)) => Err(Report::new(CacheError::SharedLoadFailed {
        key: key.to_string(),
        message: message.to_string(),
      })),
      None => Err(Report::new(CacheError::LoadAbandoned {
        key: key.to_string(),
      })),
    }
  }
}

/// Registration of the leading load for a key. Dropping it unregisters the
/// key; followers still waiting then fail with `LoadAbandoned` unless an
/// outcome was published first.
pub(crate) struct LeaderGuard<'a, T> {
  key: String,
  tx: watch::Sender<Outcome<T>>,
  owner: &'a InFlight<T>,
}

impl<T> LeaderGuard<'_, T> {
  pub(crate) fn finish(self, outcome: &Result<T>)
  where
    T: Clone,
  {
    let published = match outcome {
      Ok(value) => Ok(value.clone()),
      Err(err) => Err(Arc::from(format!("{:#}", err))),
    };
    self.tx.send_replace(Some(published));
  }
}

impl<T> Drop for LeaderGuard<'_, T> {
  fn drop(&mut self) {
    self.owner.pending.lock().remove(&self.key);
  }
}
