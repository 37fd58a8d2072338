//! Lockstep: cron-style job scheduling with cross-process mutual exclusion
//!
//! Runs periodic background jobs inside a Tokio service and guarantees that a
//! job never runs twice at the same time, even when several replicas of the
//! service share one database.
//!
//! # Features
//!
//! - Schedule jobs with:
//!   - Classic 5-field cron expressions (UTC, weekdays `0-7` with Sunday as 0 or 7).
//!   - 6/7-field cron expressions with a seconds field.
//!   - Descriptors such as `@hourly` and `@daily`.
//!   - Fixed intervals: `@every 90s`, `@every 1h30m`.
//! - Distributed, non-reentrant named locks on PostgreSQL advisory locks
//!   (`postgres` feature), routed through one pinned session per
//!   [`LockManager`]. An in-memory [`MemoryLockStore`] with the same session
//!   semantics serves tests and single-node deployments.
//! - [`RetryingJob`] decorator: lock policy (skip or fail when contended), bounded
//!   retries with capped exponential backoff, error-kind based classification.
//! - [`JobManager`]: registration, run-at-start jobs, manual triggers, live
//!   lock status, in-memory metrics and graceful shutdown that waits for every
//!   in-flight firing.
//! - Cancellable per-firing [`JobContext`] with a deadline, optionally readable
//!   through a task-local (`job_context` feature).
//! - Optional Serde support for public data types (`serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use lockstep::{async_trait, Job, JobContext, JobError, JobManager, JobPolicy, MemoryLockStore};
//!
//! struct SyncPrices;
//!
//! #[async_trait]
//! impl Job for SyncPrices {
//!     fn name(&self) -> &str { "sync_prices" }
//!     fn schedule(&self) -> &str { "*/5 * * * *" }
//!
//!     async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
//!         ctx.check()?;
//!         // ... fetch and store prices ...
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = JobManager::builder()
//!         .lock_store(Arc::new(MemoryLockStore::new()))
//!         .default_policy(JobPolicy::default().with_retries(3))
//!         .startup_job("sync_prices")
//!         .build()?;
//!
//!     manager.register_job(Arc::new(SyncPrices))?;
//!     manager.start()?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.stop_with_timeout(Duration::from_secs(60)).await?;
//!     Ok(())
//! }
//! ```

// Declare modules within the crate
pub mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod job;
pub mod lock;
mod macros;
mod manager;
pub mod metrics;
pub mod retry;
pub mod schedule;
mod worker;

// --- Public Re-exports ---

pub use async_trait::async_trait;

// Manager
pub use config::ManagerConfig;
pub use manager::{JobManager, ManagerBuilder};

// Error types
pub use error::{
  BuildError, ConfigError, ErrorKind, JobError, LockError, QueryError, RegisterError,
  ScheduleError, ShutdownError, StartError, TriggerError,
};

// Job related types
pub use job::{BoxedExecFn, DoneReason, FiringId, FnJob, Job, JobContext, JobStatus};
#[cfg(feature = "job_context")]
pub use job::context::try_get_current_job_context;
pub use retry::{JobPolicy, RetryClassifier, RetryingJob};
pub use schedule::Schedule;

// Locks
#[cfg(feature = "postgres")]
pub use lock::PgLockStore;
pub use lock::{lock_key, LockGuard, LockKey, LockManager, LockSession, LockStore, MemoryLockStore};

// Metrics related types
pub use metrics::{ManagerMetrics, MetricsSnapshot};

#[cfg(all(test, feature = "serde"))]
mod serde_tests {
  fn assert_serde<T: serde::Serialize + serde::de::DeserializeOwned>() {}

  #[test]
  fn public_records_are_serializable() {
    assert_serde::<crate::JobPolicy>();
    assert_serde::<crate::JobStatus>();
    assert_serde::<crate::MetricsSnapshot>();
    assert_serde::<crate::ErrorKind>();
    assert_serde::<crate::ManagerConfig>();
    // Enabled through this crate's `serde` feature only.
    assert_serde::<chrono::DateTime<chrono::Utc>>();
  }
}
