//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use lockstep::{
  async_trait, ErrorKind, Job, JobContext, JobError, JobManager, JobPolicy, LockManager,
  MemoryLockStore,
};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // try_init: several tests in one binary call this.
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .try_init();
}

/// A lock manager with its own session on `store`.
pub fn lock_manager(store: &MemoryLockStore) -> Arc<LockManager> {
  Arc::new(LockManager::new(Arc::new(store.clone())).with_poll_interval(StdDuration::from_millis(10)))
}

/// A manager over `store` with a short lock wait so contention resolves fast.
pub fn build_manager(store: &MemoryLockStore) -> JobManager {
  JobManager::builder()
    .lock_manager(lock_manager(store))
    .default_policy(fast_policy())
    .build()
    .expect("manager with a lock manager always builds")
}

/// Default policy with test-friendly timings.
pub fn fast_policy() -> JobPolicy {
  JobPolicy::default()
    .with_lock_timeout(StdDuration::from_millis(50))
    .with_backoff(StdDuration::from_millis(5), StdDuration::from_millis(20))
}

/// Polls `cond` every 10ms for up to `timeout`.
pub async fn wait_until(timeout: StdDuration, cond: impl Fn() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    if cond() {
      return true;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
  cond()
}

// --- Test jobs ---

/// Counts invocations, optionally working for `delay` (observing the context),
/// and tracks how many invocations overlap.
pub struct CountingJob {
  pub name: String,
  pub schedule: String,
  pub calls: Arc<AtomicUsize>,
  pub active: Arc<AtomicUsize>,
  pub max_active: Arc<AtomicUsize>,
  pub completed: Arc<AtomicUsize>,
  pub delay: StdDuration,
  pub startup: bool,
}

impl CountingJob {
  pub fn new(name: &str, schedule: &str) -> Self {
    Self {
      name: name.to_string(),
      schedule: schedule.to_string(),
      calls: Arc::new(AtomicUsize::new(0)),
      active: Arc::new(AtomicUsize::new(0)),
      max_active: Arc::new(AtomicUsize::new(0)),
      completed: Arc::new(AtomicUsize::new(0)),
      delay: StdDuration::ZERO,
      startup: false,
    }
  }

  pub fn with_delay(mut self, delay: StdDuration) -> Self {
    self.delay = delay;
    self
  }

  pub fn on_startup(mut self) -> Self {
    self.startup = true;
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Job for CountingJob {
  fn name(&self) -> &str {
    &self.name
  }

  fn schedule(&self) -> &str {
    &self.schedule
  }

  fn run_on_startup(&self) -> bool {
    self.startup
  }

  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(now_active, Ordering::SeqCst);
    let result = if self.delay > StdDuration::ZERO {
      ctx.sleep(self.delay).await.map_err(JobError::from)
    } else {
      Ok(())
    };
    self.active.fetch_sub(1, Ordering::SeqCst);
    if result.is_ok() {
      self.completed.fetch_add(1, Ordering::SeqCst);
    }
    result
  }
}

/// Fails with `kind` on the first `failures` invocations, then succeeds.
pub struct FlakyJob {
  pub name: String,
  pub calls: Arc<AtomicUsize>,
  pub failures: usize,
  pub kind: ErrorKind,
}

impl FlakyJob {
  pub fn new(name: &str, failures: usize, kind: ErrorKind) -> Self {
    Self {
      name: name.to_string(),
      calls: Arc::new(AtomicUsize::new(0)),
      failures,
      kind,
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Job for FlakyJob {
  fn name(&self) -> &str {
    &self.name
  }

  fn schedule(&self) -> &str {
    "@every 1h"
  }

  async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
    let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if call <= self.failures {
      Err(JobError::new(self.kind, format!("planned failure {}", call)))
    } else {
      Ok(())
    }
  }
}

/// Panics on every invocation.
pub struct PanickingJob {
  pub calls: Arc<AtomicUsize>,
}

impl PanickingJob {
  pub fn new() -> Self {
    Self {
      calls: Arc::new(AtomicUsize::new(0)),
    }
  }
}

#[async_trait]
impl Job for PanickingJob {
  fn name(&self) -> &str {
    "panicking"
  }

  fn schedule(&self) -> &str {
    "@every 1h"
  }

  async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    tokio::task::yield_now().await;
    panic!("job forced panic");
  }
}
