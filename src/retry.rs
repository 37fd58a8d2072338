//! Lock policy and bounded retry around a [`Job`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, JobError};
use crate::job::{panic_message, Job, JobContext};
use crate::lock::{lock_key, LockGuard, LockManager};
use crate::metrics::ManagerMetrics;

/// Decides whether a failed attempt may be retried.
pub type RetryClassifier = Arc<dyn Fn(&JobError) -> bool + Send + Sync>;

// --- Policy ---

/// Lock and retry policy applied by [`RetryingJob`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobPolicy {
  /// Longest wait for the job lock. Zero means a single non-blocking attempt.
  pub lock_timeout: Duration,
  /// Treat a contended lock as a successful no-op instead of a failure.
  pub skip_if_locked: bool,
  pub retry_on_error: bool,
  /// Retries after the first attempt; `max_attempts = max_retries + 1`.
  pub max_retries: u32,
  /// Delay before the second attempt; doubles for each later one.
  pub initial_backoff: Duration,
  /// Upper bound for any single backoff delay.
  pub max_backoff: Duration,
}

impl Default for JobPolicy {
  fn default() -> Self {
    Self {
      lock_timeout: Duration::from_secs(30),
      skip_if_locked: true,
      retry_on_error: false,
      max_retries: 0,
      initial_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(60),
    }
  }
}

impl JobPolicy {
  pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
    self.lock_timeout = timeout;
    self
  }

  pub fn with_skip_if_locked(mut self, skip: bool) -> Self {
    self.skip_if_locked = skip;
    self
  }

  /// Enables retries with up to `max_retries` extra attempts.
  pub fn with_retries(mut self, max_retries: u32) -> Self {
    self.retry_on_error = true;
    self.max_retries = max_retries;
    self
  }

  pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
    self.initial_backoff = initial;
    self.max_backoff = max;
    self
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }

  /// Delay before `attempt` (1-based): zero for the first attempt, otherwise
  /// `min(initial_backoff * 2^(attempt - 2), max_backoff)`.
  pub fn backoff_delay(&self, attempt: u32) -> Duration {
    if attempt <= 1 {
      return Duration::ZERO;
    }
    let exponent = (attempt - 2).min(31);
    self
      .initial_backoff
      .checked_mul(1u32 << exponent)
      .map_or(self.max_backoff, |d| d.min(self.max_backoff))
  }
}

// --- Decorator ---

/// A [`Job`] that runs another job under its distributed lock, with bounded
/// retries and exponential backoff.
///
/// `name`, `schedule` and `run_on_startup` delegate to the wrapped job, so a
/// `RetryingJob` can stand in wherever the wrapped job is expected.
pub struct RetryingJob {
  job: Arc<dyn Job>,
  locks: Arc<LockManager>,
  policy: JobPolicy,
  classifier: Option<RetryClassifier>,
  metrics: Option<ManagerMetrics>,
}

impl RetryingJob {
  pub fn new(job: Arc<dyn Job>, locks: Arc<LockManager>, policy: JobPolicy) -> Self {
    Self {
      job,
      locks,
      policy,
      classifier: None,
      metrics: None,
    }
  }

  /// Replaces the default classifier ([`JobError::is_retryable`]).
  ///
  /// Cancellation, deadline expiry and panics are never retried, whatever the
  /// classifier says.
  pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
    self.classifier = Some(classifier);
    self
  }

  pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
    self.metrics = Some(metrics);
    self
  }

  pub fn inner(&self) -> &Arc<dyn Job> {
    &self.job
  }

  pub fn policy(&self) -> &JobPolicy {
    &self.policy
  }

  fn record(&self, update: impl FnOnce(&ManagerMetrics)) {
    if let Some(metrics) = &self.metrics {
      update(metrics);
    }
  }

  fn should_retry(&self, err: &JobError) -> bool {
    if !self.policy.retry_on_error || err.is_cancellation() || err.kind() == ErrorKind::Panicked {
      return false;
    }
    match &self.classifier {
      Some(classify) => classify(err),
      None => err.is_retryable(),
    }
  }

  async fn attempt(&self, ctx: &JobContext) -> Result<(), JobError> {
    match AssertUnwindSafe(self.job.execute(ctx)).catch_unwind().await {
      Ok(result) => result,
      Err(payload) => {
        let message = panic_message(payload.as_ref());
        error!(job = self.job.name(), panic = %message, "Job panicked.");
        Err(JobError::panicked(format!("job panicked: {}", message)))
      }
    }
  }

  async fn run_attempts(&self, ctx: &JobContext) -> Result<(), JobError> {
    let name = self.job.name();
    let max_attempts = self.policy.max_attempts();
    let started = Instant::now();
    let mut attempt = 1;

    loop {
      if attempt > 1 {
        let delay = self.policy.backoff_delay(attempt);
        debug!(job = name, attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry.");
        if let Err(reason) = ctx.sleep(delay).await {
          info!(job = name, attempt, reason = ?reason, "Retry backoff interrupted.");
          return Err(reason.into());
        }
        self.record(|m| ManagerMetrics::incr(&m.retries_attempted));
      }

      let err = match self.attempt(ctx).await {
        Ok(()) => {
          if attempt > 1 {
            info!(job = name, attempt, "Job succeeded after retry.");
          }
          return Ok(());
        }
        Err(e) => e,
      };

      if !self.should_retry(&err) {
        return Err(err);
      }
      if attempt >= max_attempts {
        self.record(|m| ManagerMetrics::incr(&m.retries_exhausted));
        error!(
          job = name,
          attempts = attempt,
          elapsed_ms = started.elapsed().as_millis() as u64,
          error = %err,
          "Job failed after exhausting retries."
        );
        return Err(err);
      }
      warn!(job = name, attempt, max_attempts, error = %err, "Job attempt failed; will retry.");
      attempt += 1;
    }
  }
}

impl fmt::Debug for RetryingJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RetryingJob")
      .field("job", &self.job.name())
      .field("policy", &self.policy)
      .field("custom_classifier", &self.classifier.is_some())
      .finish()
  }
}

#[async_trait]
impl Job for RetryingJob {
  fn name(&self) -> &str {
    self.job.name()
  }

  fn schedule(&self) -> &str {
    self.job.schedule()
  }

  fn run_on_startup(&self) -> bool {
    self.job.run_on_startup()
  }

  fn is_retrying(&self) -> bool {
    true
  }

  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
    let name = self.job.name();
    let key = lock_key(name);
    let mut guard = LockGuard::new(self.locks.clone(), name);

    let acquired = if self.policy.lock_timeout > Duration::ZERO {
      guard.acquire_with_timeout(ctx, self.policy.lock_timeout).await
    } else {
      guard.acquire(ctx).await
    };
    let acquired = match acquired {
      Ok(acquired) => acquired,
      Err(e) => {
        if e.is_store() {
          self.record(|m| ManagerMetrics::incr(&m.lock_errors));
          error!(job = name, lock_key = key, error = %e, "Failed to acquire job lock.");
        }
        return Err(e.into());
      }
    };

    if !acquired {
      self.record(|m| ManagerMetrics::incr(&m.skipped_locked));
      if self.policy.skip_if_locked {
        info!(job = name, lock_key = key, "Job lock held elsewhere; skipping this run.");
        return Ok(());
      }
      return Err(JobError::new(
        ErrorKind::LockNotAcquired,
        format!(
          "lock for '{}' not acquired within {:?}",
          name, self.policy.lock_timeout
        ),
      ));
    }

    // The body also stops if the lock is lost with its session mid-run.
    let run_ctx = ctx.cancelled_by(guard.lease().cloned().unwrap_or_default());
    let mut result = self.run_attempts(&run_ctx).await;
    run_ctx.cancel();

    if guard.is_lost() {
      self.record(|m| ManagerMetrics::incr(&m.lock_errors));
      error!(job = name, lock_key = key, "Job lock was lost while the job was running.");
      if ctx.done_reason().is_none() {
        result = Err(JobError::new(
          ErrorKind::Lock,
          format!("lock for '{}' was lost while the job was running", name),
        ));
      }
    }

    if let Err(e) = guard.release().await {
      self.record(|m| ManagerMetrics::incr(&m.lock_errors));
      error!(job = name, lock_key = key, error = %e, "Failed to release job lock.");
    }
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_policy() {
    let policy = JobPolicy::default();
    assert_eq!(policy.lock_timeout, Duration::from_secs(30));
    assert!(policy.skip_if_locked);
    assert!(!policy.retry_on_error);
    assert_eq!(policy.max_attempts(), 1);
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let policy = JobPolicy::default();
    assert_eq!(policy.backoff_delay(1), Duration::ZERO);
    assert_eq!(policy.backoff_delay(2), Duration::from_secs(1));
    assert_eq!(policy.backoff_delay(3), Duration::from_secs(2));
    assert_eq!(policy.backoff_delay(4), Duration::from_secs(4));
    assert_eq!(policy.backoff_delay(8), Duration::from_secs(60));
    assert_eq!(policy.backoff_delay(200), Duration::from_secs(60));
  }

  #[test]
  fn builder_enables_retries() {
    let policy = JobPolicy::default()
      .with_retries(2)
      .with_backoff(Duration::from_millis(5), Duration::from_millis(8));
    assert!(policy.retry_on_error);
    assert_eq!(policy.max_attempts(), 3);
    assert_eq!(policy.backoff_delay(3), Duration::from_millis(8));
  }
}
