//! A Tokio-based job manager in the spirit of rich-client job schedulers:
//! jobs are submitted with an input describing their concurrency constraints,
//! tracked by shared futures, and gated by two mechanisms that compose:
//!
//! * a **mutex gate** serializing all jobs sharing a mutex key, in FIFO
//!   order, and
//! * **scheduling semaphores** bounding how many jobs among those bound to
//!   one run concurrently.
//!
//! Jobs can park on re-armable [`BlockingCondition`]s; a parked job releases
//! its mutex slot so peers can run, and re-competes for it at the head of the
//! queue when woken. The [`FutureRegistry`] tracks every non-terminal future
//! and supports filtered bulk await and bulk cancellation.
//!
//! ```no_run
//! use job_warden::{JobInput, JobManager};
//!
//! # async fn demo() -> Result<(), job_warden::JobError> {
//! let manager = JobManager::new(tokio::runtime::Handle::current(), "demo");
//!
//! let future = manager.submit(
//!   JobInput::new().with_name("compute").with_mutex_key("session-1"),
//!   Box::pin(async { 21 * 2 }),
//! );
//!
//! assert_eq!(future.await_done_and_take().await?, 42);
//! # Ok(())
//! # }
//! ```

mod condition;
mod error;
mod event;
mod future;
mod input;
mod manager;
mod mutex;
mod registry;
mod semaphore;

pub use condition::BlockingCondition;
pub use error::JobError;
pub use event::{EventFilter, JobEvent, JobEventKind, ListenerRegistration};
pub use future::{FutureHandle, JobBody, JobFuture, JobState, JobWork};
pub use input::{ExecutionHint, ExecutionMode, JobInput, MutexKey};
pub use manager::{JobManager, ShutdownMode};
pub use mutex::MutexGate;
pub use registry::{FutureFilter, FutureRegistry};
pub use semaphore::{PermitCallback, QueuePosition, SchedulingSemaphore};
