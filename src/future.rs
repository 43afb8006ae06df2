use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::JobError;
use crate::event::{EventFilter, JobEvent, JobEventKind, ListenerEntry, ListenerList, ListenerRegistration};
use crate::input::{ExecutionMode, JobInput, MutexKey};
use crate::manager::CURRENT_JOB;
use crate::mutex::MutexGate;
use crate::registry::FutureRegistry;
use crate::semaphore::SchedulingSemaphore;

/// The type of future the job manager executes as a job body.
pub type JobBody<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// A factory producing one job body per execution; used for recurring jobs.
pub type JobWork<R> = Box<dyn FnMut() -> JobBody<R> + Send + 'static>;

pub(crate) enum WorkKind<R> {
  Once(Option<JobBody<R>>),
  Factory(JobWork<R>),
}

/// Lifecycle state of a job's future.
///
/// Transitions are monotonic per target state, except that `Done` and
/// `Rejected` are absorbing: once reached, further state-change requests are
/// silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  NotStarted,
  /// Queued for its mutex slot, or accepted but not yet commenced execution.
  Pending,
  Running,
  /// Parked on a [`BlockingCondition`](crate::BlockingCondition); the mutex
  /// slot is released while in this state, the semaphore permit is not.
  WaitingForBlockingCondition,
  /// Queued for a permit of its scheduling semaphore.
  WaitingForPermit,
  Done,
  Rejected,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobState::Done | JobState::Rejected)
  }
}

/// Object-safe view onto a job's future, independent of its result type.
///
/// This is the currency of the [`FutureRegistry`], the filters, and the
/// concurrency gates, which all deal with futures of heterogeneous result
/// types.
pub trait FutureHandle: Send + Sync {
  fn id(&self) -> u64;

  fn name(&self) -> &str;

  fn state(&self) -> JobState;

  /// `true` once the future reached `Done` or `Rejected`.
  fn is_done(&self) -> bool;

  fn is_cancelled(&self) -> bool;

  /// Cancels the job. Idempotent; returns whether this call caused a
  /// not-yet-done future to move toward termination.
  ///
  /// A job that has not commenced execution is terminated immediately; a
  /// running job has its body interrupted if `interrupt_running` is set, and
  /// otherwise keeps running with its eventual result discarded. A job parked
  /// on a blocking condition is always woken, and only that job.
  fn cancel(&self, interrupt_running: bool) -> bool;

  fn mutex_key(&self) -> Option<MutexKey>;

  fn semaphore(&self) -> Option<Arc<SchedulingSemaphore>>;

  /// Token cancelled when the job's execution is interrupted. Job bodies may
  /// use it for cooperative cancellation checks.
  fn cancellation_token(&self) -> &CancellationToken;

  fn contains_execution_hint(&self, hint: &str) -> bool;

  /// Associates the hint with the future; returns `false` if already present.
  fn add_execution_hint(&self, hint: &str) -> bool;

  fn remove_execution_hint(&self, hint: &str) -> bool;
}

/// The result-type-independent part of a job's future: identity, state
/// machine, done signal, execution hints and listeners.
pub(crate) struct FutureCore {
  id: u64,
  input: JobInput,
  deadline: Option<Instant>,
  token: CancellationToken,
  state: Mutex<JobState>,
  cancelled: AtomicBool,
  finished: AtomicBool,
  failure: Mutex<Option<JobError>>,
  done_tx: watch::Sender<bool>,
  hints: RwLock<HashSet<String>>,
  listeners: ListenerList,
  next_listener_id: AtomicU64,
  registry: Weak<FutureRegistry>,
  gate: Weak<MutexGate>,
}

impl FutureCore {
  pub(crate) fn new(id: u64, input: JobInput, registry: Weak<FutureRegistry>, gate: Weak<MutexGate>) -> Arc<Self> {
    let (done_tx, _) = watch::channel(false);
    let hints = input.execution_hints.clone();
    let deadline = input.expires_after.map(|d| Instant::now() + d);

    Arc::new(Self {
      id,
      input,
      deadline,
      token: CancellationToken::new(),
      state: Mutex::new(JobState::NotStarted),
      cancelled: AtomicBool::new(false),
      finished: AtomicBool::new(false),
      failure: Mutex::new(None),
      done_tx,
      hints: RwLock::new(hints),
      listeners: Arc::new(RwLock::new(Vec::new())),
      next_listener_id: AtomicU64::new(0),
      registry,
      gate,
    })
  }

  pub(crate) fn input(&self) -> &JobInput {
    &self.input
  }

  pub(crate) fn execution_mode(&self) -> ExecutionMode {
    self.input.execution_mode
  }

  /// `true` if the expiration deadline elapsed before the job commenced
  /// execution. The deadline is fixed at submission time.
  pub(crate) fn is_expired(&self) -> bool {
    self.deadline.is_some_and(|deadline| Instant::now() > deadline)
  }

  /// Sets the new state and notifies listeners, unless already terminal.
  pub(crate) fn change_state(&self, state: JobState) {
    {
      let mut current = self.state.lock();
      if current.is_terminal() {
        trace!(id = self.id, ?state, "State change ignored, future already terminal.");
        return;
      }
      *current = state;
    }

    // Transitions into these states require manual signaling of registry
    // waiters; terminal transitions are covered by registry removal.
    if matches!(
      state,
      JobState::Pending | JobState::Running | JobState::WaitingForBlockingCondition | JobState::WaitingForPermit
    ) {
      if let Some(registry) = self.registry.upgrade() {
        registry.signal();
      }
    }

    self.fire_event(JobEventKind::StateChanged(state));
  }

  /// Moves the future into the given terminal state exactly once; later calls
  /// are no-ops. Fulfills the done signal, notifies listeners, and removes
  /// the future from its registry.
  pub(crate) fn finish(&self, failure: Option<JobError>, terminal: JobState) {
    debug_assert!(terminal.is_terminal());
    if self.finished.swap(true, AtomicOrdering::SeqCst) {
      return;
    }

    *self.failure.lock() = failure;
    self.change_state(terminal);
    let _ = self.done_tx.send(true);

    if let Some(registry) = self.registry.upgrade() {
      registry.remove(self.id);
    }
    self.listeners.write().clear();

    debug!(id = self.id, name = %self.input.name, ?terminal, ?failure, "Job reached terminal state.");
  }

  pub(crate) fn failure(&self) -> Option<JobError> {
    *self.failure.lock()
  }

  pub(crate) fn mark_cancelled(&self) {
    self.cancelled.store(true, AtomicOrdering::SeqCst);
  }

  /// Returns the semaphore permit and mutex slot still held by this future,
  /// if any. Both releases are no-ops for a non-owner, so this is safe to
  /// call regardless of how far the job got.
  pub(crate) fn release_owned_gates(&self) {
    if let Some(semaphore) = &self.input.semaphore {
      semaphore.release(self);
    }
    if let (Some(key), Some(gate)) = (&self.input.mutex_key, self.gate.upgrade()) {
      gate.pass_to_next(key, self.id);
    }
  }

  /// Suspends until the future reaches a terminal state.
  pub(crate) async fn await_done_signal(&self) -> Result<(), JobError> {
    self.deadlock_guard()?;
    let mut done_rx = self.done_tx.subscribe();
    let _ = done_rx.wait_for(|done| *done).await.map_err(|_| JobError::Interrupted)?;
    Ok(())
  }

  /// Refuses to wait if the calling job owns a permit of the same scheduling
  /// semaphore as this future, because such a wait could never be satisfied
  /// if all permits are held by waiting jobs.
  pub(crate) fn deadlock_guard(&self) -> Result<(), JobError> {
    let current = match CURRENT_JOB.try_with(|current| current.core.clone()) {
      Ok(core) => core,
      Err(_) => return Ok(()), // not called from within a job
    };

    let Some(current_semaphore) = current.input.semaphore.clone() else {
      return Ok(()); // the calling job has no concurrency restriction
    };
    if !current_semaphore.is_owner_id(current.id) {
      return Ok(()); // the calling job does not own a permit
    }
    if self.is_done() {
      return Ok(());
    }
    if let Some(target_semaphore) = &self.input.semaphore {
      if Arc::ptr_eq(&current_semaphore, target_semaphore) {
        return Err(JobError::DeadlockDetected);
      }
    }
    Ok(())
  }

  fn fire_event(&self, kind: JobEventKind) {
    let event = JobEvent {
      future_id: self.id,
      kind,
    };

    // Snapshot under the lock, invoke outside of it.
    let snapshot: Vec<Arc<ListenerEntry>> = self.listeners.read().iter().cloned().collect();
    for entry in snapshot {
      if entry.filter.as_ref().is_none_or(|filter| filter(&event)) {
        (entry.listener)(&event);
      }
    }
  }

  fn register_listener(
    &self,
    filter: Option<EventFilter>,
    listener: impl Fn(&JobEvent) + Send + Sync + 'static,
  ) -> ListenerRegistration {
    let listener_id = self.next_listener_id.fetch_add(1, AtomicOrdering::Relaxed);
    self.listeners.write().push(Arc::new(ListenerEntry {
      id: listener_id,
      filter,
      listener: Box::new(listener),
    }));
    ListenerRegistration::new(&self.listeners, listener_id)
  }
}

impl FutureHandle for FutureCore {
  fn id(&self) -> u64 {
    self.id
  }

  fn name(&self) -> &str {
    &self.input.name
  }

  fn state(&self) -> JobState {
    *self.state.lock()
  }

  fn is_done(&self) -> bool {
    self.finished.load(AtomicOrdering::SeqCst)
  }

  fn is_cancelled(&self) -> bool {
    self.cancelled.load(AtomicOrdering::SeqCst)
  }

  fn cancel(&self, interrupt_running: bool) -> bool {
    if self.is_done() {
      trace!(id = self.id, "Cancel: future already done.");
      return false;
    }
    let newly_cancelled = !self.cancelled.swap(true, AtomicOrdering::SeqCst);
    debug!(id = self.id, name = %self.input.name, interrupt_running, "Cancellation requested.");

    match self.state() {
      JobState::NotStarted | JobState::Pending | JobState::WaitingForPermit => {
        // Not executing yet: terminate immediately. Anything the job already
        // owns is handed on; queue slots it still competes for resolve
        // lazily at grant time.
        self.token.cancel();
        self.release_owned_gates();
        self.finish(Some(JobError::Cancelled), JobState::Done);
      }
      JobState::WaitingForBlockingCondition => {
        // The mutex slot was handed off at park time; only the retained
        // semaphore permit is returned here. Wake only this future.
        self.release_owned_gates();
        self.finish(Some(JobError::Cancelled), JobState::Done);
        self.token.cancel();
      }
      JobState::Running => {
        if interrupt_running {
          self.token.cancel();
        }
        // The future terminates now even if the body keeps running; its
        // gates are handed on so peers are not held up by an abandoned body.
        self.release_owned_gates();
        self.finish(Some(JobError::Cancelled), JobState::Done);
      }
      JobState::Done | JobState::Rejected => {}
    }

    newly_cancelled
  }

  fn mutex_key(&self) -> Option<MutexKey> {
    self.input.mutex_key.clone()
  }

  fn semaphore(&self) -> Option<Arc<SchedulingSemaphore>> {
    self.input.semaphore.clone()
  }

  fn cancellation_token(&self) -> &CancellationToken {
    &self.token
  }

  fn contains_execution_hint(&self, hint: &str) -> bool {
    self.hints.read().contains(hint)
  }

  fn add_execution_hint(&self, hint: &str) -> bool {
    let added = self.hints.write().insert(hint.to_string());
    if let Some(registry) = self.registry.upgrade() {
      registry.signal();
    }
    self.fire_event(JobEventKind::HintAdded(hint.to_string()));
    added
  }

  fn remove_execution_hint(&self, hint: &str) -> bool {
    let removed = self.hints.write().remove(hint);
    if let Some(registry) = self.registry.upgrade() {
      registry.signal();
    }
    self.fire_event(JobEventKind::HintRemoved(hint.to_string()));
    removed
  }
}

/// Handle representing one scheduled, running or completed unit of work.
///
/// Obtained from [`JobManager::submit`](crate::JobManager::submit); shared
/// via `Arc`, so any party may await, observe or cancel the job.
pub struct JobFuture<R: Send + 'static> {
  core: Arc<FutureCore>,
  work: Mutex<WorkKind<R>>,
  result: Mutex<Option<R>>,
}

impl<R: Send + 'static> JobFuture<R> {
  pub(crate) fn new(core: Arc<FutureCore>, work: WorkKind<R>) -> Arc<Self> {
    Arc::new(Self {
      core,
      work: Mutex::new(work),
      result: Mutex::new(None),
    })
  }

  pub(crate) fn core(&self) -> &Arc<FutureCore> {
    &self.core
  }

  /// Produces the body for the next execution; `None` once a one-shot body
  /// has been consumed.
  pub(crate) fn next_body(&self) -> Option<JobBody<R>> {
    match &mut *self.work.lock() {
      WorkKind::Once(body) => body.take(),
      WorkKind::Factory(factory) => Some(factory()),
    }
  }

  /// Stores the result and moves the future into `Done`. A job cancelled
  /// without interruption keeps running; its eventual result is discarded
  /// here.
  pub(crate) fn complete_ok(&self, value: R) {
    if self.core.is_cancelled() {
      self.core.finish(Some(JobError::Cancelled), JobState::Done);
      return;
    }
    *self.result.lock() = Some(value);
    self.core.finish(None, JobState::Done);
  }

  pub fn id(&self) -> u64 {
    self.core.id
  }

  pub fn name(&self) -> &str {
    self.core.name()
  }

  pub fn state(&self) -> JobState {
    self.core.state()
  }

  pub fn is_done(&self) -> bool {
    self.core.is_done()
  }

  pub fn is_cancelled(&self) -> bool {
    self.core.is_cancelled()
  }

  /// See [`FutureHandle::cancel`].
  pub fn cancel(&self, interrupt_running: bool) -> bool {
    self.core.cancel(interrupt_running)
  }

  pub fn cancellation_token(&self) -> &CancellationToken {
    self.core.cancellation_token()
  }

  pub fn contains_execution_hint(&self, hint: &str) -> bool {
    self.core.contains_execution_hint(hint)
  }

  pub fn add_execution_hint(&self, hint: &str) -> bool {
    self.core.add_execution_hint(hint)
  }

  pub fn remove_execution_hint(&self, hint: &str) -> bool {
    self.core.remove_execution_hint(hint)
  }

  /// The type-erased view of this future, as stored in the registry and the
  /// gates.
  pub fn handle(self: &Arc<Self>) -> Arc<dyn FutureHandle> {
    self.core.clone()
  }

  /// Registers a callback invoked on every event accepted by the optional
  /// filter; returns a disposable registration.
  pub fn add_listener(
    &self,
    filter: Option<EventFilter>,
    listener: impl Fn(&JobEvent) + Send + Sync + 'static,
  ) -> ListenerRegistration {
    self.core.register_listener(filter, listener)
  }

  /// Suspends the calling task (never the worker) until this future reaches
  /// a terminal state.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::DeadlockDetected`] without waiting if the calling
  /// job owns a permit on the same scheduling semaphore as this future.
  pub async fn await_done(&self) -> Result<(), JobError> {
    self.core.await_done_signal().await
  }

  /// Like [`await_done`](Self::await_done), but gives up with
  /// [`JobError::Timeout`] once the given duration elapsed. The job itself is
  /// unaffected by the timeout and keeps running.
  pub async fn await_done_for(&self, timeout: Duration) -> Result<(), JobError> {
    self.core.deadlock_guard()?;
    tokio::time::timeout(timeout, self.core.await_done_signal())
      .await
      .map_err(|_| JobError::Timeout)?
  }

  /// Awaits the terminal state and takes the job's result.
  ///
  /// The successful result can be taken exactly once; subsequent calls return
  /// [`JobError::ResultTaken`]. Failure outcomes (cancellation, rejection,
  /// panic) are observable by every caller.
  pub async fn await_done_and_take(&self) -> Result<R, JobError> {
    self.await_done().await?;
    if let Some(failure) = self.core.failure() {
      return Err(failure);
    }
    self.result.lock().take().ok_or(JobError::ResultTaken)
  }
}
