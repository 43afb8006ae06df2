use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::trace;

use crate::error::JobError;
use crate::future::FutureHandle;

/// Predicate over job futures, used to select a subset of the registry for
/// bulk operations. `None` in the APIs below selects every future.
pub type FutureFilter = dyn Fn(&dyn FutureHandle) -> bool + Send + Sync;

/// The set of all futures that are not in a terminal state yet.
///
/// Futures register themselves upon submission and deregister upon reaching
/// `Done` or `Rejected`. Waiters blocked in
/// [`await_all_done`](Self::await_all_done) are re-evaluated on every
/// registration change, relevant state change and execution hint change.
pub struct FutureRegistry {
  futures: RwLock<HashMap<u64, Arc<dyn FutureHandle>>>,
  changed: Notify,
}

impl FutureRegistry {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      futures: RwLock::new(HashMap::new()),
      changed: Notify::new(),
    })
  }

  pub(crate) fn add(&self, future: Arc<dyn FutureHandle>) {
    self.futures.write().insert(future.id(), future);
    self.changed.notify_waiters();
  }

  pub(crate) fn remove(&self, id: u64) {
    if self.futures.write().remove(&id).is_some() {
      trace!(id, "Future removed from registry.");
    }
    self.changed.notify_waiters();
  }

  /// Wakes waiters so they re-evaluate their filters; invoked by futures on
  /// state changes and execution hint changes.
  pub(crate) fn signal(&self) {
    self.changed.notify_waiters();
  }

  /// Number of registered (non-terminal) futures.
  pub fn count(&self, filter: Option<&FutureFilter>) -> usize {
    self
      .futures
      .read()
      .values()
      .filter(|future| filter.is_none_or(|filter| filter(future.as_ref())))
      .count()
  }

  fn snapshot(&self, filter: Option<&FutureFilter>) -> Vec<Arc<dyn FutureHandle>> {
    self
      .futures
      .read()
      .values()
      .filter(|future| filter.is_none_or(|filter| filter(future.as_ref())))
      .cloned()
      .collect()
  }

  fn matches_all(&self, filter: Option<&FutureFilter>, predicate: impl Fn(&dyn FutureHandle) -> bool) -> bool {
    self.snapshot(filter).iter().all(|future| predicate(future.as_ref()))
  }

  /// Visits every registered future accepted by the filter; stops early if
  /// the visitor returns `false`. The visit iterates over a snapshot, so
  /// futures registered concurrently may be missed.
  pub fn visit(&self, filter: Option<&FutureFilter>, mut visitor: impl FnMut(&dyn FutureHandle) -> bool) {
    for future in self.snapshot(filter) {
      if !visitor(future.as_ref()) {
        return;
      }
    }
  }

  /// Suspends until every future accepted by the filter reached a terminal
  /// state. Returns immediately if none matches. Because terminal futures
  /// deregister, this effectively waits for the filtered subset to drain.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::Timeout`] if the condition did not hold within the
  /// given duration.
  pub async fn await_all_done(&self, filter: Option<&FutureFilter>, timeout: Option<Duration>) -> Result<(), JobError> {
    let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    loop {
      // Register interest before checking, so a signal arriving between the
      // check and the wait is not lost.
      let mut notified = std::pin::pin!(self.changed.notified());
      notified.as_mut().enable();
      if self.matches_all(filter, |future| future.is_done()) {
        return Ok(());
      }
      match deadline {
        Some(deadline) => {
          if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return Err(JobError::Timeout);
          }
        }
        None => notified.await,
      }
    }
  }

  /// Cancels every registered future accepted by the filter. Returns `true`
  /// if all cancellations took effect, which is vacuously the case when no
  /// future matches.
  pub fn cancel_all(&self, filter: Option<&FutureFilter>, interrupt_running: bool) -> bool {
    self
      .snapshot(filter)
      .iter()
      .map(|future| future.cancel(interrupt_running))
      .fold(true, |all, cancelled| all && cancelled)
  }
}
