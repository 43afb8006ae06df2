use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::semaphore::SchedulingSemaphore;

/// The logical owner identity used to serialize jobs, e.g. one UI session.
///
/// Jobs submitted with the same key never run concurrently; they are served
/// in FIFO order, except that a job re-competing after a blocking condition
/// is inserted at the head of the queue.
pub type MutexKey = String;

/// A string tag associated with a job, evaluated by filters when listening to
/// job events, awaiting job completion, or cancelling jobs in bulk.
pub type ExecutionHint = String;

/// How often a job body runs before its future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
  /// The body runs exactly once; its return value completes the future.
  #[default]
  Single,
  /// The body is re-run after every successful completion, re-competing for
  /// its mutex slot and semaphore permit each time. The future only completes
  /// upon cancellation, expiration, a panicking run, or manager shutdown; the
  /// expiration deadline is fixed at submission time.
  Recurring,
}

/// Execution instructions for a job: its name, the concurrency gates it is
/// subject to, an optional expiration deadline, execution hints and the
/// execution mode.
///
/// The `with_*` methods consume and return `self` to support method chaining.
#[derive(Default, Clone)]
pub struct JobInput {
  pub(crate) name: String,
  pub(crate) mutex_key: Option<MutexKey>,
  pub(crate) semaphore: Option<Arc<SchedulingSemaphore>>,
  pub(crate) expires_after: Option<Duration>,
  pub(crate) execution_hints: HashSet<ExecutionHint>,
  pub(crate) execution_mode: ExecutionMode,
}

impl JobInput {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the name of the job, used for logging purposes.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Binds the job to a mutex key so that it runs mutually exclusive to all
  /// other jobs sharing that key.
  pub fn with_mutex_key(mut self, key: impl Into<MutexKey>) -> Self {
    self.mutex_key = Some(key.into());
    self
  }

  /// Binds the job to a scheduling semaphore to control the maximal number of
  /// jobs running concurrently among that same semaphore.
  ///
  /// With a semaphore in place, the job only commences execution once a permit
  /// is or becomes available.
  pub fn with_semaphore(mut self, semaphore: Arc<SchedulingSemaphore>) -> Self {
    self.semaphore = Some(semaphore);
    self
  }

  /// Sets the maximal time until the job must commence execution. If elapsed,
  /// the job is cancelled and never commences execution. By default, there is
  /// no expiration.
  pub fn with_expiration(mut self, expires_after: Duration) -> Self {
    self.expires_after = Some(expires_after);
    self
  }

  /// Associates the job with an execution hint. A job may carry multiple
  /// hints, and hints can be added and removed while the job is alive.
  pub fn with_execution_hint(mut self, hint: impl Into<ExecutionHint>) -> Self {
    self.execution_hints.insert(hint.into());
    self
  }

  pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
    self.execution_mode = mode;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn mutex_key(&self) -> Option<&MutexKey> {
    self.mutex_key.as_ref()
  }

  pub fn semaphore(&self) -> Option<&Arc<SchedulingSemaphore>> {
    self.semaphore.as_ref()
  }

  pub fn expires_after(&self) -> Option<Duration> {
    self.expires_after
  }

  pub fn execution_mode(&self) -> ExecutionMode {
    self.execution_mode
  }
}
