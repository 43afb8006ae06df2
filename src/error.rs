use thiserror::Error;

/// Errors surfaced by the job machinery.
///
/// Cancellation is a first-class terminal outcome and not a failure of the
/// machinery itself; it still appears here because a cancelled job's result
/// slot carries it to whoever awaits the job.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
  #[error("potential deadlock detected: cannot await a job bound to the same scheduling semaphore while owning one of its permits")]
  DeadlockDetected,

  #[error("maximal wait time elapsed before the awaited jobs reached a terminal state")]
  Timeout,

  #[error("wait interrupted because the waiting job was cancelled")]
  Interrupted,

  #[error("job rejected because the job manager is shut down")]
  Rejected,

  #[error("job was cancelled")]
  Cancelled,

  #[error("job body panicked during execution")]
  Panicked,

  #[error("job result was already taken by a previous await")]
  ResultTaken,

  #[error("semaphore is sealed, its capacity can no longer be changed")]
  SemaphoreSealed,
}
