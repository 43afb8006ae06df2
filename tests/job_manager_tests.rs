use job_warden::{
  JobError, JobEventKind, JobInput, JobManager, JobState, SchedulingSemaphore, ShutdownMode,
};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,job_warden=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn test_manager(name: &str) -> JobManager {
  JobManager::new(tokio::runtime::Handle::current(), name)
}

#[tokio::test]
async fn test_submit_and_await_result() {
  setup_tracing_for_test();
  let manager = test_manager("test_basic_submit");

  let future = manager.submit(
    JobInput::new().with_name("compute"),
    Box::pin(async move {
      sleep(Duration::from_millis(20)).await;
      21 * 2
    }),
  );

  assert_eq!(future.await_done_and_take().await, Ok(42));
  assert_eq!(future.state(), JobState::Done);
  assert!(future.is_done());
  assert!(!future.is_cancelled());
}

#[tokio::test]
async fn test_result_can_be_taken_exactly_once() {
  setup_tracing_for_test();
  let manager = test_manager("test_result_once");

  let future = manager.submit(JobInput::new().with_name("once"), Box::pin(async move { "value" }));

  assert_eq!(future.await_done_and_take().await, Ok("value"));
  assert_eq!(future.await_done_and_take().await, Err(JobError::ResultTaken));
}

#[tokio::test]
async fn test_panicking_body_fails_the_future() {
  setup_tracing_for_test();
  let manager = test_manager("test_panic");

  let future = manager.submit::<()>(
    JobInput::new().with_name("exploder"),
    Box::pin(async move {
      panic!("boom");
    }),
  );

  assert_eq!(future.await_done_and_take().await, Err(JobError::Panicked));
  assert_eq!(future.state(), JobState::Done);
}

#[tokio::test]
async fn test_cancel_interrupts_a_running_job() {
  setup_tracing_for_test();
  let manager = test_manager("test_cancel_running");

  let future = manager.submit(
    JobInput::new().with_name("long"),
    Box::pin(async move {
      sleep(Duration::from_secs(60)).await;
      "never"
    }),
  );
  sleep(Duration::from_millis(30)).await;
  assert_eq!(future.state(), JobState::Running);

  assert!(future.cancel(true));
  assert_eq!(future.await_done_and_take().await, Err(JobError::Cancelled));
  assert!(future.is_cancelled());

  // A second cancel request is a no-op.
  assert!(!future.cancel(true));
}

#[tokio::test]
async fn test_await_with_timeout_leaves_the_job_running() {
  setup_tracing_for_test();
  let manager = test_manager("test_await_timeout");

  let future = manager.submit(
    JobInput::new().with_name("slow"),
    Box::pin(async move {
      sleep(Duration::from_secs(60)).await;
    }),
  );

  assert_eq!(future.await_done_for(Duration::from_millis(40)).await, Err(JobError::Timeout));
  // The timeout only gave up the wait; the job itself is unaffected.
  assert!(!future.is_done());
  assert_eq!(future.state(), JobState::Running);

  future.cancel(true);
  assert_eq!(future.await_done_for(Duration::from_secs(5)).await, Ok(()));
}

#[tokio::test]
async fn test_cancel_without_interrupt_discards_the_result() {
  setup_tracing_for_test();
  let manager = test_manager("test_cancel_soft");
  let body_completed = Arc::new(AtomicUsize::new(0));

  let future = {
    let body_completed = body_completed.clone();
    manager.submit(
      JobInput::new().with_name("soft-cancelled"),
      Box::pin(async move {
        sleep(Duration::from_millis(80)).await;
        body_completed.fetch_add(1, Ordering::SeqCst);
        "discarded"
      }),
    )
  };
  sleep(Duration::from_millis(30)).await;

  assert!(future.cancel(false));
  // The future terminates right away...
  assert_eq!(future.await_done_and_take().await, Err(JobError::Cancelled));
  // ...while the body runs to completion on its own.
  sleep(Duration::from_millis(100)).await;
  assert_eq!(body_completed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_expired_job_never_commences_execution() {
  setup_tracing_for_test();
  let manager = test_manager("test_expiration");
  let ran = Arc::new(AtomicUsize::new(0));

  // Block the key so the second job cannot commence before its deadline.
  let blocker = manager.submit(
    JobInput::new().with_name("blocker").with_mutex_key("session"),
    Box::pin(async move {
      sleep(Duration::from_millis(100)).await;
    }),
  );

  let expired = {
    let ran = ran.clone();
    manager.submit(
      JobInput::new()
        .with_name("too-late")
        .with_mutex_key("session")
        .with_expiration(Duration::from_millis(20)),
      Box::pin(async move {
        ran.fetch_add(1, Ordering::SeqCst);
      }),
    )
  };

  blocker.await_done().await.unwrap();
  assert_eq!(expired.await_done_and_take().await, Err(JobError::Cancelled));
  assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recurring_job_reruns_until_cancelled() {
  setup_tracing_for_test();
  let manager = test_manager("test_recurring");
  let runs = Arc::new(AtomicUsize::new(0));

  let future = {
    let runs = runs.clone();
    manager.submit_recurring(
      JobInput::new().with_name("heartbeat"),
      Box::new(move || {
        let runs = runs.clone();
        Box::pin(async move {
          runs.fetch_add(1, Ordering::SeqCst);
          sleep(Duration::from_millis(10)).await;
        })
      }),
    )
  };

  sleep(Duration::from_millis(120)).await;
  assert!(!future.is_done());
  let runs_so_far = runs.load(Ordering::SeqCst);
  assert!(runs_so_far > 1, "expected multiple runs, saw {}", runs_so_far);

  future.cancel(true);
  assert_eq!(future.await_done_and_take().await, Err(JobError::Cancelled));

  // No further runs after cancellation.
  let runs_at_cancel = runs.load(Ordering::SeqCst);
  sleep(Duration::from_millis(60)).await;
  assert_eq!(runs.load(Ordering::SeqCst), runs_at_cancel);
}

#[tokio::test]
async fn test_listener_observes_lifecycle_events() {
  setup_tracing_for_test();
  let manager = test_manager("test_listener");
  let gate = job_warden::BlockingCondition::new(true);

  let future = {
    let gate = gate.clone();
    manager.submit(
      JobInput::new().with_name("observed"),
      Box::pin(async move {
        gate.wait_for().await.unwrap();
      }),
    )
  };

  let states = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let registration = {
    let states = states.clone();
    future.add_listener(None, move |event| {
      if let JobEventKind::StateChanged(state) = &event.kind {
        states.lock().push(*state);
      }
    })
  };

  sleep(Duration::from_millis(30)).await;
  gate.set_blocking(false);
  future.await_done().await.unwrap();

  let states = states.lock().clone();
  assert!(states.contains(&JobState::WaitingForBlockingCondition));
  assert_eq!(states.last(), Some(&JobState::Done));
  registration.dispose();
}

#[tokio::test]
async fn test_listener_filter_selects_events() {
  setup_tracing_for_test();
  let manager = test_manager("test_listener_filter");
  let gate = job_warden::BlockingCondition::new(true);

  let future = {
    let gate = gate.clone();
    manager.submit(
      JobInput::new().with_name("hinting"),
      Box::pin(async move {
        gate.wait_for().await.unwrap();
      }),
    )
  };

  let hint_events = Arc::new(AtomicUsize::new(0));
  let _registration = {
    let hint_events = hint_events.clone();
    future.add_listener(
      Some(Box::new(|event| {
        matches!(event.kind, JobEventKind::HintAdded(_) | JobEventKind::HintRemoved(_))
      })),
      move |_event| {
        hint_events.fetch_add(1, Ordering::SeqCst);
      },
    )
  };

  future.add_execution_hint("phase-1");
  future.remove_execution_hint("phase-1");
  assert_eq!(hint_events.load(Ordering::SeqCst), 2);

  gate.set_blocking(false);
  future.await_done().await.unwrap();
  // State changes were filtered out.
  assert_eq!(hint_events.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
  setup_tracing_for_test();
  let manager = test_manager("test_reject_after_shutdown");
  manager.shutdown(ShutdownMode::Graceful);
  assert!(manager.is_shutdown());

  let future = manager.submit(JobInput::new().with_name("late"), Box::pin(async move { "late" }));
  assert_eq!(future.state(), JobState::Rejected);
  assert_eq!(future.await_done_and_take().await, Err(JobError::Rejected));
}

#[tokio::test]
async fn test_graceful_shutdown_lets_running_jobs_finish() {
  setup_tracing_for_test();
  let manager = test_manager("test_graceful_shutdown");

  let running = manager.submit(
    JobInput::new().with_name("running").with_mutex_key("session"),
    Box::pin(async move {
      sleep(Duration::from_millis(80)).await;
      "finished"
    }),
  );
  sleep(Duration::from_millis(30)).await;

  let queued = manager.submit(
    JobInput::new().with_name("queued").with_mutex_key("session"),
    Box::pin(async move { "never" }),
  );

  manager.shutdown(ShutdownMode::Graceful);

  assert_eq!(running.await_done_and_take().await, Ok("finished"));
  assert_eq!(queued.await_done_and_take().await, Err(JobError::Cancelled));
}

#[tokio::test]
async fn test_forceful_shutdown_interrupts_running_jobs() {
  setup_tracing_for_test();
  let manager = test_manager("test_forceful_shutdown");

  let running = manager.submit(
    JobInput::new().with_name("running"),
    Box::pin(async move {
      sleep(Duration::from_secs(60)).await;
      "never"
    }),
  );
  sleep(Duration::from_millis(30)).await;

  manager.shutdown(ShutdownMode::ForcefulCancel);
  assert_eq!(running.await_done_and_take().await, Err(JobError::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_randomized_mix_of_keys_and_semaphore_drains_cleanly() {
  setup_tracing_for_test();
  let manager = test_manager("test_stress_mix");
  let semaphore = SchedulingSemaphore::new(3);
  let completed = Arc::new(AtomicUsize::new(0));

  let mut rng = rand::rng();
  let mut futures = Vec::new();
  for i in 0..40 {
    let key = format!("key-{}", rng.random_range(0..4));
    let with_semaphore = rng.random_bool(0.5);
    let delay_ms = rng.random_range(1..15);

    let mut input = JobInput::new().with_name(format!("job-{}", i)).with_mutex_key(key);
    if with_semaphore {
      input = input.with_semaphore(semaphore.clone());
    }

    let completed = completed.clone();
    let future = manager.submit(
      input,
      Box::pin(async move {
        sleep(Duration::from_millis(delay_ms)).await;
        completed.fetch_add(1, Ordering::SeqCst);
      }),
    );
    futures.push(future);
  }

  manager
    .registry()
    .await_all_done(None, Some(Duration::from_secs(30)))
    .await
    .unwrap();

  assert_eq!(completed.load(Ordering::SeqCst), 40);
  assert_eq!(semaphore.competitor_count(), 0);
  for key in 0..4 {
    assert_eq!(manager.mutex_gate().permit_count(&format!("key-{}", key)), 0);
  }
  for future in futures {
    assert!(future.is_done());
  }
}
