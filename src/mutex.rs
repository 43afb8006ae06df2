use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, error, trace};

use crate::error::JobError;
use crate::future::FutureHandle;
use crate::input::MutexKey;
use crate::manager::next_job_id;
use crate::semaphore::{PermitCallback, QueuePosition};

struct MutexCompetitor {
  /// Identity under which the competitor waits; usually the future's own id,
  /// but a fresh id for reacquisition entries, which swap in the future's id
  /// only upon acquisition.
  id: u64,
  future: Arc<dyn FutureHandle>,
  callback: PermitCallback,
}

#[derive(Default)]
struct KeyState {
  /// Owner plus queued competitors; the per-key record is removed once this
  /// drops to zero.
  permits: usize,
  owner: Option<u64>,
  queue: VecDeque<MutexCompetitor>,
}

/// Serializes jobs sharing a mutex key: at most one such job runs at any
/// time, the others wait in FIFO order.
///
/// Per-key records exist only while at least one job owns or awaits the
/// mutex slot; an unused key occupies no memory.
pub struct MutexGate {
  keys: RwLock<HashMap<MutexKey, KeyState>>,
}

impl MutexGate {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      keys: RwLock::new(HashMap::new()),
    })
  }

  pub fn is_owner(&self, key: &str, id: u64) -> bool {
    self.keys.read().get(key).is_some_and(|state| state.owner == Some(id))
  }

  /// Number of jobs currently owning or waiting for the key's mutex slot.
  pub fn permit_count(&self, key: &str) -> usize {
    self.keys.read().get(key).map_or(0, |state| state.permits)
  }

  /// Makes the future compete for the key's mutex slot under its own id.
  /// Returns whether the slot was acquired immediately; the callback is
  /// invoked either way, immediately on acquisition or upon a later handoff.
  pub(crate) fn enqueue_or_acquire(
    &self,
    key: &str,
    future: Arc<dyn FutureHandle>,
    position: QueuePosition,
    callback: PermitCallback,
  ) -> bool {
    let competitor_id = future.id();
    self.enqueue_competitor(
      key,
      MutexCompetitor {
        id: competitor_id,
        future,
        callback,
      },
      position,
    )
  }

  fn enqueue_competitor(&self, key: &str, competitor: MutexCompetitor, position: QueuePosition) -> bool {
    let acquired_callback = {
      let mut keys = self.keys.write();
      let state = keys.entry(key.to_string()).or_default();
      state.permits += 1;
      if state.permits == 1 {
        state.owner = Some(competitor.id);
        trace!(key, id = competitor.id, "Mutex slot acquired immediately.");
        Some(competitor.callback)
      } else {
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

  /// Releases the slot held under `owner_id` and hands it to the next queued
  /// competitor, invoking its acquisition callback. A no-op if `owner_id`
  /// does not hold the slot, so cancellation and regular completion may race
  /// on the release without double-handoff.
  pub(crate) fn pass_to_next(&self, key: &str, owner_id: u64) {
    if let Some(next) = self.release_and_poll(key, owner_id) {
      debug!(key, from = owner_id, to = next.id, name = %next.future.name(), "Mutex slot passed to next competitor.");
      (next.callback)();
    }
  }

  fn release_and_poll(&self, key: &str, owner_id: u64) -> Option<MutexCompetitor> {
    let mut keys = self.keys.write();
    let Some(state) = keys.get_mut(key) else {
      trace!(key, owner_id, "Release ignored, key is not tracked.");
      return None;
    };
    if state.owner != Some(owner_id) {
      trace!(key, owner_id, current_owner = ?state.owner, "Release ignored, not the slot owner.");
      return None;
    }

    let next = state.queue.pop_front();
    state.owner = next.as_ref().map(|competitor| competitor.id);
    state.permits = state.permits.saturating_sub(1);
    if state.permits == 0 {
      keys.remove(key);
    }
    next
  }

  /// Swaps the identity under which the slot is held; used when a
  /// reacquisition entry acquires the slot on behalf of a resuming future.
  fn replace_owner(&self, key: &str, old_id: u64, new_id: u64) {
    let mut keys = self.keys.write();
    let Some(state) = keys.get_mut(key) else {
      error!(key, old_id, "Mutex owner replacement on an unknown key.");
      debug_assert!(false, "mutex owner replacement on an unknown key");
      return;
    };
    if state.owner != Some(old_id) {
      error!(key, old_id, current_owner = ?state.owner, "Mutex owner replacement by a non-owner.");
      debug_assert!(false, "mutex owner replacement by a non-owner");
      return;
    }
    state.owner = Some(new_id);
  }

  /// Re-competes for the key's mutex slot at the head of the queue and
  /// suspends until it is acquired; used by futures resuming from a blocking
  /// condition.
  ///
  /// The competition entry carries a fresh id so that a concurrent
  /// cancellation of the future (which gives up the wait) cannot be confused
  /// with the future's earlier ownership of the slot.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::Interrupted`] if the future is cancelled while
  /// waiting; an already-acquired slot is passed along in that case.
  pub(crate) async fn reacquire(self: &Arc<Self>, key: &str, future: Arc<dyn FutureHandle>) -> Result<(), JobError> {
    let reacquisition_id = next_job_id();
    let (acquired_tx, mut acquired_rx) = oneshot::channel::<()>();

    let gate = self.clone();
    let key_owned = key.to_string();
    let future_id = future.id();
    let callback = Box::new(move || {
      gate.replace_owner(&key_owned, reacquisition_id, future_id);
      // The waiter gave up (cancelled); pass the slot along.
      if acquired_tx.send(()).is_err() {
        gate.pass_to_next(&key_owned, future_id);
      }
    });

    self.enqueue_competitor(
      key,
      MutexCompetitor {
        id: reacquisition_id,
        future: future.clone(),
        callback,
      },
      QueuePosition::Head,
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
    // sees its send fail and passes the slot along itself, while a grant
    // whose send already went through made this future the owner, so the
    // owner-checked hand-off below passes exactly that slot on.
    acquired_rx.close();
    self.pass_to_next(key, future.id());
    Err(JobError::Interrupted)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::future::FutureCore;
  use crate::input::JobInput;
  use std::sync::Weak;

  fn test_future(name: &str) -> Arc<dyn FutureHandle> {
    FutureCore::new(next_job_id(), JobInput::new().with_name(name), Weak::new(), Weak::new())
  }

  #[test]
  fn release_by_non_owner_is_ignored() {
    let gate = MutexGate::new();
    let (f1, f2) = (test_future("f1"), test_future("f2"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("session", f1.clone(), QueuePosition::Tail, track("f1"));
    gate.enqueue_or_acquire("session", f2.clone(), QueuePosition::Tail, track("f2"));

    // Neither a queued competitor nor a stranger may release the slot.
    gate.pass_to_next("session", f2.id());
    gate.pass_to_next("other", f1.id());
    assert!(gate.is_owner("session", f1.id()));
    assert_eq!(*acquired.lock(), vec!["f1"]);
  }

  fn tracker() -> (Arc<parking_lot::Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> PermitCallback) {
    let acquired = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let acquired_ref = acquired.clone();
    let track = move |label: &'static str| -> PermitCallback {
      let acquired = acquired_ref.clone();
      Box::new(move || acquired.lock().push(label))
    };
    (acquired, track)
  }

  #[test]
  fn first_competitor_acquires_immediately() {
    let gate = MutexGate::new();
    let f1 = test_future("f1");

    assert!(gate.enqueue_or_acquire("session", f1.clone(), QueuePosition::Tail, Box::new(|| {})));
    assert!(gate.is_owner("session", f1.id()));
    assert_eq!(gate.permit_count("session"), 1);
  }

  #[test]
  fn slot_is_passed_in_fifo_order_and_record_removed_when_drained() {
    let gate = MutexGate::new();
    let (f1, f2, f3) = (test_future("f1"), test_future("f2"), test_future("f3"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("session", f1.clone(), QueuePosition::Tail, track("f1"));
    gate.enqueue_or_acquire("session", f2.clone(), QueuePosition::Tail, track("f2"));
    gate.enqueue_or_acquire("session", f3.clone(), QueuePosition::Tail, track("f3"));
    assert_eq!(gate.permit_count("session"), 3);
    assert_eq!(*acquired.lock(), vec!["f1"]);

    gate.pass_to_next("session", f1.id());
    assert!(gate.is_owner("session", f2.id()));
    assert_eq!(*acquired.lock(), vec!["f1", "f2"]);

    gate.pass_to_next("session", f2.id());
    gate.pass_to_next("session", f3.id());
    assert_eq!(*acquired.lock(), vec!["f1", "f2", "f3"]);
    assert_eq!(gate.permit_count("session"), 0);
    assert!(gate.keys.read().is_empty());
  }

  #[test]
  fn head_competitor_precedes_queued_tail() {
    let gate = MutexGate::new();
    let (f1, f2, f3) = (test_future("f1"), test_future("f2"), test_future("f3"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("session", f1.clone(), QueuePosition::Tail, track("f1"));
    gate.enqueue_or_acquire("session", f2.clone(), QueuePosition::Tail, track("f2"));
    gate.enqueue_or_acquire("session", f3.clone(), QueuePosition::Head, track("f3"));

    gate.pass_to_next("session", f1.id());
    assert_eq!(*acquired.lock(), vec!["f1", "f3"]);
  }

  #[tokio::test]
  async fn abandoned_reacquisition_passes_the_slot_on() {
    let gate = MutexGate::new();
    let (owner, resumer, third) = (test_future("owner"), test_future("resumer"), test_future("third"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("session", owner.clone(), QueuePosition::Tail, track("owner"));

    let reacquire = {
      let gate = gate.clone();
      let resumer = resumer.clone();
      tokio::spawn(async move { gate.reacquire("session", resumer).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    gate.enqueue_or_acquire("session", third.clone(), QueuePosition::Tail, track("third"));

    // The resumer gives up before the slot reaches its reacquisition entry.
    resumer.cancel(true);
    assert_eq!(reacquire.await.unwrap(), Err(JobError::Interrupted));

    // Granting to the abandoned entry hands the slot straight to the third
    // competitor; no double-handoff, no stuck slot.
    gate.pass_to_next("session", owner.id());
    assert_eq!(*acquired.lock(), vec!["owner", "third"]);
    assert!(gate.is_owner("session", third.id()));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn slot_granted_to_a_cancelling_resumer_is_not_stranded() {
    let gate = MutexGate::new();
    let (owner, resumer) = (test_future("owner"), test_future("resumer"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("session", owner.clone(), QueuePosition::Tail, track("owner"));

    let reacquire = {
      let gate = gate.clone();
      let resumer = resumer.clone();
      tokio::spawn(async move { gate.reacquire("session", resumer).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Cancel the resumer and grant its reacquisition entry concurrently.
    // Whichever side wins the race, the slot must not stay with the
    // terminated resumer.
    resumer.cancel(true);
    gate.pass_to_next("session", owner.id());

    if reacquire.await.unwrap().is_ok() {
      // The grant beat the cancellation; the caller owns the slot and
      // releases it as usual.
      gate.pass_to_next("session", resumer.id());
    }
    assert!(!gate.is_owner("session", resumer.id()));
    assert_eq!(gate.permit_count("session"), 0);

    let third = test_future("third");
    assert!(gate.enqueue_or_acquire("session", third.clone(), QueuePosition::Tail, track("third")));
    assert_eq!(*acquired.lock(), vec!["owner", "third"]);
  }

  #[test]
  fn keys_are_independent() {
    let gate = MutexGate::new();
    let (f1, f2) = (test_future("f1"), test_future("f2"));
    let (acquired, track) = tracker();

    gate.enqueue_or_acquire("a", f1.clone(), QueuePosition::Tail, track("f1"));
    gate.enqueue_or_acquire("b", f2.clone(), QueuePosition::Tail, track("f2"));

    // Both acquired immediately, no contention across keys.
    assert_eq!(*acquired.lock(), vec!["f1", "f2"]);
    assert!(gate.is_owner("a", f1.id()));
    assert!(gate.is_owner("b", f2.id()));
  }
}
