use job_warden::{JobInput, JobManager, SchedulingSemaphore};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn session_work(id: usize, delay_ms: u64) -> String {
  info!("Job {} starting, will sleep for {}ms", id, delay_ms);
  tokio::time::sleep(Duration::from_millis(delay_ms)).await;
  let result = format!("Job {} finished after {}ms", id, delay_ms);
  info!("{}", result);
  result
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false) // Disable module paths for cleaner example output
    .init();

  info!("--- Mutual Exclusion Example ---");

  let manager = JobManager::new(Handle::current(), "demo");
  let semaphore = SchedulingSemaphore::new(2);

  let mut futures = Vec::new();
  for i in 0..6 {
    // Two sessions; jobs of the same session run strictly one after another,
    // and the semaphore additionally caps total concurrency at 2.
    let session = format!("session-{}", i % 2);
    let future = manager.submit(
      JobInput::new()
        .with_name(format!("job-{}", i))
        .with_mutex_key(session)
        .with_semaphore(semaphore.clone()),
      Box::pin(async move { session_work(i, 300).await }),
    );
    info!("Submitted job {} with future id {}", i, future.id());
    futures.push(future);
  }

  info!("All jobs submitted. Awaiting results...");
  for future in futures {
    let id = future.id();
    match future.await_done_and_take().await {
      Ok(result) => info!("Result for future {}: {}", id, result),
      Err(e) => info!("Error for future {}: {:?}", id, e),
    }
  }

  info!("Shutting down.");
  manager.shutdown(job_warden::ShutdownMode::Graceful);
  info!("--- Mutual Exclusion Example End ---");
}
