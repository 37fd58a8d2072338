//! demos/two_replicas.rs
//!
//! Two managers (standing in for two service replicas) share one in-memory
//! lock store and the same job schedule. Every firing runs on exactly one of
//! them; the other logs a skip.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use lockstep::{job_fn, FnJob, JobManager, JobPolicy, MemoryLockStore};
use tracing::info;

fn replica(store: &MemoryLockStore, runs: Arc<AtomicUsize>, label: &'static str) -> Result<JobManager, Box<dyn std::error::Error>> {
  let manager = JobManager::builder()
    .lock_store(Arc::new(store.clone()))
    .default_policy(JobPolicy::default().with_lock_timeout(StdDuration::from_millis(200)))
    .build()?;

  let exec = job_fn!(ctx => {
    let runs = runs.clone();
  } {
    let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
    info!(replica = label, run, firing_id = %ctx.firing_id, "Running cleanup.");
    match ctx.sleep(StdDuration::from_millis(700)).await {
      Ok(()) => Ok(()),
      Err(reason) => Err(reason.into()),
    }
  });
  manager.register_job(Arc::new(FnJob::new("cleanup", "@every 1s", exec)))?;
  Ok(manager)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,lockstep=info,two_replicas=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let store = MemoryLockStore::new();
  let runs = Arc::new(AtomicUsize::new(0));
  let a = replica(&store, runs.clone(), "a")?;
  let b = replica(&store, runs.clone(), "b")?;

  a.start()?;
  b.start()?;
  info!("Both replicas running for 5 seconds...");
  tokio::time::sleep(StdDuration::from_secs(5)).await;

  a.stop().await?;
  b.stop().await?;

  let skipped = a.metrics_snapshot().skipped_locked + b.metrics_snapshot().skipped_locked;
  info!(
    runs = runs.load(Ordering::SeqCst),
    skipped, "Done. Each tick ran once; the other replica skipped."
  );
  Ok(())
}
