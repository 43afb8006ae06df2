use std::sync::Arc;

use parking_lot::RwLock;

use crate::future::JobState;
use crate::input::ExecutionHint;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEventKind {
  StateChanged(JobState),
  HintAdded(ExecutionHint),
  HintRemoved(ExecutionHint),
}

/// A lifecycle event fired by a job's future to its registered listeners.
#[derive(Debug, Clone)]
pub struct JobEvent {
  pub future_id: u64,
  pub kind: JobEventKind,
}

pub type EventFilter = Box<dyn Fn(&JobEvent) -> bool + Send + Sync>;

pub(crate) struct ListenerEntry {
  pub(crate) id: u64,
  pub(crate) filter: Option<EventFilter>,
  pub(crate) listener: Box<dyn Fn(&JobEvent) + Send + Sync>,
}

pub(crate) type ListenerList = Arc<RwLock<Vec<Arc<ListenerEntry>>>>;

/// Disposable handle for a listener registered on a job's future.
pub struct ListenerRegistration {
  entries: std::sync::Weak<RwLock<Vec<Arc<ListenerEntry>>>>,
  listener_id: u64,
}

impl ListenerRegistration {
  pub(crate) fn new(entries: &ListenerList, listener_id: u64) -> Self {
    Self {
      entries: Arc::downgrade(entries),
      listener_id,
    }
  }

  /// Unregisters the listener. Listeners are also dropped in bulk once their
  /// future reaches a terminal state, so disposal is only required to stop
  /// listening early.
  pub fn dispose(&self) {
    if let Some(entries) = self.entries.upgrade() {
      entries.write().retain(|entry| entry.id != self.listener_id);
    }
  }
}
