use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use lazy_static::lazy_static;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::JobError;
use crate::future::{FutureCore, FutureHandle, JobBody, JobFuture, JobState, JobWork, WorkKind};
use crate::input::{ExecutionMode, JobInput};
use crate::mutex::MutexGate;
use crate::registry::FutureRegistry;
use crate::semaphore::QueuePosition;

lazy_static! {
  static ref NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);
}

/// Process-wide unique id for futures and internal queue entries.
pub(crate) fn next_job_id() -> u64 {
  NEXT_JOB_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

tokio::task_local! {
  /// The job a task is executing on behalf of; set for the duration of every
  /// job body and consulted by blocking conditions and the deadlock guard.
  pub(crate) static CURRENT_JOB: CurrentJob;
}

#[derive(Clone)]
pub(crate) struct CurrentJob {
  pub(crate) core: Arc<FutureCore>,
  pub(crate) manager: JobManager,
}

/// How [`JobManager::shutdown`] treats jobs that are still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Jobs that have not commenced execution are cancelled; running and parked
  /// jobs are left to finish on their own.
  Graceful,
  /// Every job is cancelled and running bodies are interrupted.
  ForcefulCancel,
}

/// Entry point for submitting jobs.
///
/// Jobs run as tasks on the given Tokio runtime, gated by the manager's
/// per-key mutex and any scheduling semaphore named in their input. The
/// manager is cheap to clone; clones share all state.
#[derive(Clone)]
pub struct JobManager {
  name: Arc<String>,
  tokio_handle: Handle,
  registry: Arc<FutureRegistry>,
  mutex_gate: Arc<MutexGate>,
  shutdown_token: CancellationToken,
}

impl JobManager {
  pub fn new(tokio_handle: Handle, name: impl Into<String>) -> Self {
    let name = name.into();
    info!(manager = %name, "Job manager created.");
    Self {
      name: Arc::new(name),
      tokio_handle,
      registry: FutureRegistry::new(),
      mutex_gate: MutexGate::new(),
      shutdown_token: CancellationToken::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn registry(&self) -> &Arc<FutureRegistry> {
    &self.registry
  }

  pub fn mutex_gate(&self) -> &Arc<MutexGate> {
    &self.mutex_gate
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Submits a one-shot job; the body's return value becomes the future's
  /// result.
  pub fn submit<R: Send + 'static>(&self, mut input: JobInput, body: JobBody<R>) -> Arc<JobFuture<R>> {
    input.execution_mode = ExecutionMode::Single;
    self.schedule(input, WorkKind::Once(Some(body)))
  }

  /// Submits a recurring job; the factory produces one body per run, and the
  /// job re-competes for its mutex slot and semaphore permit before each run.
  /// The future completes only upon cancellation, expiration, a panicking
  /// run, or manager shutdown.
  pub fn submit_recurring<R: Send + 'static>(&self, mut input: JobInput, work: JobWork<R>) -> Arc<JobFuture<R>> {
    input.execution_mode = ExecutionMode::Recurring;
    self.schedule(input, WorkKind::Factory(work))
  }

  fn schedule<R: Send + 'static>(&self, input: JobInput, work: WorkKind<R>) -> Arc<JobFuture<R>> {
    let id = next_job_id();
    let core = FutureCore::new(
      id,
      input,
      Arc::downgrade(&self.registry),
      Arc::downgrade(&self.mutex_gate),
    );
    let future = JobFuture::new(core, work);

    debug!(manager = %self.name, id, name = %future.name(), "Job submitted.");
    self.registry.add(future.handle());
    self.dispatch(future.clone());
    future
  }

  /// Enters the job into its concurrency gates, mutex first, then semaphore,
  /// then spawns the body. Re-invoked for every run of a recurring job.
  fn dispatch<R: Send + 'static>(&self, future: Arc<JobFuture<R>>) {
    let core = future.core().clone();
    if self.is_shutdown() {
      self.reject_job(&core);
      return;
    }
    core.change_state(JobState::Pending);

    match core.input().mutex_key().cloned() {
      Some(key) => {
        let manager = self.clone();
        let queued = future.clone();
        self.mutex_gate.enqueue_or_acquire(
          &key,
          future.handle(),
          QueuePosition::Tail,
          Box::new(move || manager.acquire_permit_then_spawn(queued)),
        );
      }
      None => self.acquire_permit_then_spawn(future),
    }
  }

  fn acquire_permit_then_spawn<R: Send + 'static>(&self, future: Arc<JobFuture<R>>) {
    let core = future.core().clone();
    // Cancelled while queued for the mutex slot; resolve lazily at grant time.
    if core.is_done() {
      core.release_owned_gates();
      return;
    }

    match core.input().semaphore().cloned() {
      Some(semaphore) => {
        core.change_state(JobState::WaitingForPermit);
        let manager = self.clone();
        let queued = future.clone();
        semaphore.compete(
          future.handle(),
          QueuePosition::Tail,
          Box::new(move || manager.spawn_body(queued)),
        );
      }
      None => self.spawn_body(future),
    }
  }

  fn spawn_body<R: Send + 'static>(&self, future: Arc<JobFuture<R>>) {
    let core = future.core().clone();
    if core.is_done() {
      core.release_owned_gates();
      return;
    }
    if self.is_shutdown() {
      self.reject_job(&core);
      return;
    }

    let manager = self.clone();
    let current = CurrentJob {
      core: core.clone(),
      manager: manager.clone(),
    };
    let span = info_span!("job", name = %core.name(), id = core.id());
    self
      .tokio_handle
      .spawn(CURRENT_JOB.scope(current, manager.run_job(future)).instrument(span));
  }

  async fn run_job<R: Send + 'static>(self, future: Arc<JobFuture<R>>) {
    let core = future.core().clone();
    if core.is_done() {
      core.release_owned_gates();
      return;
    }
    if core.is_expired() {
      warn!(id = core.id(), name = %core.name(), "Job expired before commencing execution.");
      core.cancel(true);
      return;
    }

    let Some(body) = future.next_body() else {
      core.release_owned_gates();
      core.finish(None, JobState::Done);
      return;
    };

    core.change_state(JobState::Running);
    let outcome: Result<R, JobError> = tokio::select! {
      biased;
      _ = core.cancellation_token().cancelled() => Err(JobError::Cancelled),
      result = std::panic::AssertUnwindSafe(body).catch_unwind() => {
        result.map_err(|_| JobError::Panicked)
      }
    };

    match outcome {
      Ok(_value)
        if core.execution_mode() == ExecutionMode::Recurring
          && !core.is_cancelled()
          && !core.is_expired()
          && !self.is_shutdown() =>
      {
        // Re-compete from scratch so other jobs of the same key or semaphore
        // are not starved between runs.
        core.release_owned_gates();
        self.dispatch(future);
      }
      Ok(value) if core.execution_mode() == ExecutionMode::Single => {
        core.release_owned_gates();
        future.complete_ok(value);
      }
      Ok(_value) => {
        // A recurring job overtaken by cancellation, expiration or shutdown.
        core.release_owned_gates();
        core.finish(Some(JobError::Cancelled), JobState::Done);
      }
      Err(failure) => {
        if failure == JobError::Panicked {
          warn!(id = core.id(), name = %core.name(), "Job body panicked.");
        }
        core.release_owned_gates();
        core.finish(Some(failure), JobState::Done);
      }
    }
  }

  fn reject_job(&self, core: &Arc<FutureCore>) {
    debug!(id = core.id(), name = %core.name(), "Job rejected, manager is shut down.");
    core.mark_cancelled();
    core.cancellation_token().cancel();
    core.release_owned_gates();
    core.finish(Some(JobError::Rejected), JobState::Rejected);
  }

  /// Stops accepting jobs and cancels alive jobs according to the mode. Jobs
  /// submitted afterwards are rejected.
  pub fn shutdown(&self, mode: ShutdownMode) {
    info!(manager = %self.name, ?mode, "Job manager shutting down.");
    self.shutdown_token.cancel();

    match mode {
      ShutdownMode::Graceful => {
        let not_commenced = |future: &dyn FutureHandle| {
          matches!(
            future.state(),
            JobState::NotStarted | JobState::Pending | JobState::WaitingForPermit
          )
        };
        self.registry.cancel_all(Some(&not_commenced), false);
      }
      ShutdownMode::ForcefulCancel => {
        self.registry.cancel_all(None, true);
      }
    }
  }
}
