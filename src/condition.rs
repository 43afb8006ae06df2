use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::error::JobError;
use crate::future::{FutureCore, FutureHandle, JobState};
use crate::manager::{CurrentJob, CURRENT_JOB};

/// A re-armable condition on which jobs park until it is cleared.
///
/// While parked, a job gives up its mutex slot so that other jobs sharing the
/// key can run, and re-competes for it at the head of the queue upon wakeup.
/// The semaphore permit, by contrast, stays with the parked job. Clearing the
/// condition is a broadcast: all parked waiters resume, in no guaranteed
/// order relative to each other. The condition can be set blocking again
/// afterwards and reused.
pub struct BlockingCondition {
  blocking: watch::Sender<bool>,
}

impl BlockingCondition {
  pub fn new(blocking: bool) -> Arc<Self> {
    let (tx, _) = watch::channel(blocking);
    Arc::new(Self { blocking: tx })
  }

  pub fn is_blocking(&self) -> bool {
    *self.blocking.borrow()
  }

  /// Arms or clears the condition. Clearing wakes every waiter currently
  /// parked on it; the order in which they resume is unspecified (waiters
  /// holding a mutex key still serialize through their key's queue).
  pub fn set_blocking(&self, blocking: bool) {
    self.blocking.send_replace(blocking);
  }

  /// Parks the caller until the condition is cleared.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::Interrupted`] if the calling job is cancelled while
  /// parked; its mutex slot is not reacquired in that case.
  pub async fn wait_for(&self) -> Result<(), JobError> {
    self.wait_internal(None, &[]).await
  }

  /// Like [`wait_for`](Self::wait_for), but associates the given execution
  /// hints with the calling job for the duration of the wait, so filters can
  /// identify jobs parked for a specific reason.
  pub async fn wait_for_with_hints(&self, hints: &[&str]) -> Result<(), JobError> {
    self.wait_internal(None, hints).await
  }

  /// Like [`wait_for`](Self::wait_for), but gives up with
  /// [`JobError::Timeout`] once the given duration elapsed. A mutex-owning
  /// job still reacquires its slot before the error is returned, so the
  /// caller resumes under mutual exclusion either way.
  pub async fn wait_for_timeout(&self, timeout: Duration) -> Result<(), JobError> {
    self.wait_internal(Some(timeout), &[]).await
  }

  async fn wait_internal(&self, timeout: Option<Duration>, hints: &[&str]) -> Result<(), JobError> {
    if !self.is_blocking() {
      return Ok(());
    }

    match CURRENT_JOB.try_with(|current| current.clone()) {
      Ok(current) => self.wait_as_job(current, timeout, hints).await,
      Err(_) => self.wait_plain(timeout).await,
    }
  }

  /// Wait path for callers outside of any job.
  async fn wait_plain(&self, timeout: Option<Duration>) -> Result<(), JobError> {
    let mut rx = self.blocking.subscribe();
    let wait = rx.wait_for(|blocking| !*blocking);
    match timeout {
      Some(timeout) => match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result.map(|_| ()).map_err(|_| JobError::Interrupted),
        Err(_) => Err(JobError::Timeout),
      },
      None => wait.await.map(|_| ()).map_err(|_| JobError::Interrupted),
    }
  }

  async fn wait_as_job(&self, current: CurrentJob, timeout: Option<Duration>, hints: &[&str]) -> Result<(), JobError> {
    let core: Arc<FutureCore> = current.core;
    for hint in hints {
      core.add_execution_hint(hint);
    }

    // Give up the mutex slot for the duration of the park; other jobs of the
    // same key may run meanwhile.
    let gate = current.manager.mutex_gate().clone();
    let held_key = core
      .input()
      .mutex_key()
      .filter(|key| gate.is_owner(key.as_str(), core.id()))
      .cloned();

    core.change_state(JobState::WaitingForBlockingCondition);
    if let Some(key) = &held_key {
      debug!(id = core.id(), key = %key, "Job parks on blocking condition, mutex slot handed off.");
      gate.pass_to_next(key, core.id());
    }

    let parked = self.park(&core, timeout).await;
    let outcome = match parked {
      Err(JobError::Interrupted) => {
        // Cancelled while parked; the future is terminating and must not
        // re-compete for its mutex slot.
        self.remove_hints(&core, hints);
        return Err(JobError::Interrupted);
      }
      other => other,
    };

    core.change_state(JobState::Pending);
    if let Some(key) = &held_key {
      if let Err(err) = gate.reacquire(key, core.clone()).await {
        self.remove_hints(&core, hints);
        return Err(err);
      }
    }
    core.change_state(JobState::Running);

    self.remove_hints(&core, hints);
    outcome
  }

  async fn park(&self, core: &Arc<FutureCore>, timeout: Option<Duration>) -> Result<(), JobError> {
    let mut rx = self.blocking.subscribe();
    let wait = rx.wait_for(|blocking| !*blocking);
    tokio::select! {
      biased;
      _ = core.cancellation_token().cancelled() => Err(JobError::Interrupted),
      result = async {
        match timeout {
          Some(timeout) => match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result.map(|_| ()).map_err(|_| JobError::Interrupted),
            Err(_) => Err(JobError::Timeout),
          },
          None => wait.await.map(|_| ()).map_err(|_| JobError::Interrupted),
        }
      } => result,
    }
  }

  fn remove_hints(&self, core: &Arc<FutureCore>, hints: &[&str]) {
    for hint in hints {
      core.remove_execution_hint(hint);
    }
  }
}
