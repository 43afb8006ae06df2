use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::JobError;
use crate::future::FutureHandle;

/// Where a competitor enters the waiting queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
  /// Ahead of all current waiters; used for jobs resuming from a blocking
  /// condition so they are not starved by newcomers.
  Head,
  Tail,
}

/// Invoked exactly once when the permit is acquired. Never invoked under the
/// semaphore's internal lock.
pub type PermitCallback = Box<dyn FnOnce() + Send + Sync>;

struct Competitor {
  future: Arc<dyn FutureHandle>,
  callback: PermitCallback,
}

struct SemaphoreState {
  capacity: usize,
  owners: HashSet<u64>,
  queue: VecDeque<Competitor>,
}

/// A counting semaphore bounding how many jobs among those bound to it run
/// concurrently.
///
/// Competitors beyond the capacity wait in FIFO order (subject to
/// [`QueuePosition`]). The capacity may be adjusted until the first
/// competitor arrives; from then on the semaphore is sealed. Raising the
/// capacity before sealing never strands waiters because no competitor can
/// have arrived yet.
pub struct SchedulingSemaphore {
  state: RwLock<SemaphoreState>,
  sealed: AtomicBool,
}

impl SchedulingSemaphore {
  pub fn new(capacity: usize) -> Arc<Self> {
    Arc::new(Self {
      state: RwLock::new(SemaphoreState {
        capacity,
        owners: HashSet::new(),
        queue: VecDeque::new(),
      }),
      sealed: AtomicBool::new(false),
    })
  }

  /// Changes the number of permits.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::SemaphoreSealed`] once the first competitor arrived.
  pub fn set_capacity(&self, capacity: usize) -> Result<(), JobError> {
    if self.sealed.load(AtomicOrdering::SeqCst) {
      return Err(JobError::SemaphoreSealed);
    }
    self.state.write().capacity = capacity;
    Ok(())
  }

  /// Permanently forbids further capacity changes.
  pub fn seal(&self) {
    self.sealed.store(true, AtomicOrdering::SeqCst);
  }

  pub fn is_sealed(&self) -> bool {
    self.sealed.load(AtomicOrdering::SeqCst)
  }

  pub fn capacity(&self) -> usize {
    self.state.read().capacity
  }

  /// Number of jobs currently owning or waiting for a permit.
  pub fn competitor_count(&self) -> usize {
    let state = self.state.read();
    state.owners.len() + state.queue.len()
  }

  pub fn is_permit_owner(&self, future: &dyn FutureHandle) -> bool {
    self.is_owner_id(future.id())
  }

  pub(crate) fn is_owner_id(&self, id: u64) -> bool {
    self.state.read().owners.contains(&id)
  }

  /// Makes the future compete for a permit. If one is free and no other
  /// competitor waits ahead, the permit is acquired and the callback invoked
  /// before this method returns; otherwise the competitor is queued and the
  /// callback fires upon a later [`release`](Self::release).
  ///
  /// Returns whether the permit was acquired immediately.
  pub fn compete(&self, future: Arc<dyn FutureHandle>, position: QueuePosition, callback: PermitCallback) -> bool {
    self.seal();

    let acquired_callback = {
      let mut state = self.state.write();
      if state.queue.is_empty() && state.owners.len() < state.capacity {
        state.owners.insert(future.id());
        trace!(id = future.id(), "Permit acquired immediately.");
        Some(callback)
      } else {
        let competitor = Competitor { future, callback };
        match position {
          QueuePosition::Head => state.queue.push_front(competitor),
          QueuePosition::Tail => state.queue.push_back(competitor),
        }
        None
      }
    };

    match acquired_callback {
      Some(callback) => {
        callback();
        true
      }
      None => false,
    }
  }

  /// Releases the future's permit and passes it to the next competitor in the
  /// queue, if any. A no-op if the future owns no permit, so cancellation and
  /// regular completion may race on the release without double-handoff.
  pub fn release(&self, future: &dyn FutureHandle) {
    let next = {
      let mut state = self.state.write();
      if !state.owners.remove(&future.id()) {
        trace!(id = future.id(), "Release ignored, future owns no permit.");
        return;
      }
      match state.queue.pop_front() {
        Some(next) => {
          state.owners.insert(next.future.id());
          Some(next)
        }
        None => None,
      }
    };

    if let Some(next) = next {
      debug!(from = future.id(), to = next.future.id(), "Permit passed to next competitor.");
      (next.callback)();
    }
  }

  /// Competes for a permit and suspends until it is acquired.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::Interrupted`] if the future is cancelled while
  /// waiting; an already-granted permit is released again in that case.
  pub async fn acquire(self: &Arc<Self>, future: Arc<dyn FutureHandle>) -> Result<(), JobError> {
    let (acquired_tx, mut acquired_rx) = oneshot::channel::<()>();

    let semaphore = self.clone();
    let waiter = future.clone();
    self.compete(
      future.clone(),
      QueuePosition::Tail,
      Box::new(move || {
        // The waiter gave up (cancelled); pass the permit along.
        if acquired_tx.send(()).is_err() {
          semaphore.release(waiter.as_ref());
        }
      }),
    );

    let granted = tokio::select! {
      biased;
      result = &mut acquired_rx => result.is_ok(),
      _ = future.cancellation_token().cancelled() => false,
    };
    if granted {
      return Ok(());
    }

    // Shut the channel before giving up: from here on the grant callback
    // sees its send fail and passes the permit along itself, while a grant
    // whose send already went through left this future as the owner, so the
    // owner-checked release below returns exactly that permit.
    acquired_rx.close();
    self.release(future.as_ref());
    Err(JobError::Interrupted)
  }
}
