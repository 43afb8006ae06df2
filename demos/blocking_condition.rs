use job_warden::{BlockingCondition, JobInput, JobManager};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Blocking Condition Example ---");

  let manager = JobManager::new(Handle::current(), "demo");
  let data_ready = BlockingCondition::new(true);

  // The consumer acquires the session mutex first, then parks on the
  // condition. Parking hands the mutex slot to the producer, which would
  // otherwise deadlock behind the consumer.
  let consumer = {
    let data_ready = data_ready.clone();
    manager.submit(
      JobInput::new().with_name("consumer").with_mutex_key("session"),
      Box::pin(async move {
        info!("Consumer waiting for data...");
        data_ready.wait_for().await?;
        info!("Consumer resumed under the session mutex.");
        Ok::<_, job_warden::JobError>("consumed")
      }),
    )
  };

  tokio::time::sleep(Duration::from_millis(100)).await;

  let producer = {
    let data_ready = data_ready.clone();
    manager.submit(
      JobInput::new().with_name("producer").with_mutex_key("session"),
      Box::pin(async move {
        info!("Producer running, publishing data.");
        tokio::time::sleep(Duration::from_millis(200)).await;
        data_ready.set_blocking(false);
        "produced"
      }),
    )
  };

  match producer.await_done_and_take().await {
    Ok(result) => info!("Producer result: {}", result),
    Err(e) => info!("Producer error: {:?}", e),
  }
  match consumer.await_done_and_take().await {
    Ok(result) => info!("Consumer result: {:?}", result),
    Err(e) => info!("Consumer error: {:?}", e),
  }

  info!("--- Blocking Condition Example End ---");
}
