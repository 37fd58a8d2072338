use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;

/// Type alias for the unique identifier of a single firing of a job.
pub type FiringId = Uuid;

/// Why a [`JobContext`] is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
  Cancelled,
  DeadlineExceeded,
}

impl fmt::Display for DoneReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DoneReason::Cancelled => f.write_str("context cancelled"),
      DoneReason::DeadlineExceeded => f.write_str("deadline exceeded"),
    }
  }
}

impl From<DoneReason> for JobError {
  fn from(reason: DoneReason) -> Self {
    match reason {
      DoneReason::Cancelled => JobError::cancelled(),
      DoneReason::DeadlineExceeded => JobError::deadline_exceeded(),
    }
  }
}

/// Cancellable, request-scoped handle passed to every `Job::execute` call.
///
/// A context is done when its token (or any parent token) is cancelled or when
/// its deadline passes. Cloning is cheap; clones share the same token.
#[derive(Clone, Debug)]
pub struct JobContext {
  /// The job this handle was created for (empty for detached contexts).
  pub job_name: String,
  /// Unique ID of this execution.
  pub firing_id: FiringId,
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Default for JobContext {
  fn default() -> Self {
    Self::background()
  }
}

impl JobContext {
  /// A context that is never cancelled and has no deadline.
  pub fn background() -> Self {
    Self {
      job_name: String::new(),
      firing_id: Uuid::new_v4(),
      token: CancellationToken::new(),
      deadline: None,
    }
  }

  /// A context driven by an existing cancellation token.
  pub fn with_token(token: CancellationToken) -> Self {
    Self {
      token,
      ..Self::background()
    }
  }

  /// Derives a context for one execution of `job_name`.
  ///
  /// The child is cancelled whenever `self` is; its deadline is the earlier of
  /// the parent's deadline and `now + timeout`.
  pub fn for_firing(&self, job_name: &str, timeout: Option<Duration>) -> Self {
    let own_deadline = timeout.map(|t| Instant::now() + t);
    let deadline = match (self.deadline, own_deadline) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (a, b) => a.or(b),
    };
    Self {
      job_name: job_name.to_string(),
      firing_id: Uuid::new_v4(),
      token: self.token.child_token(),
      deadline,
    }
  }

  /// Derives a child with an additional timeout, keeping name and firing id.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    let mut child = self.for_firing(&self.job_name, Some(timeout));
    child.firing_id = self.firing_id;
    child
  }

  /// Derives a child that is also cancelled once `trigger` is.
  ///
  /// The relay task ends with whichever of the two is cancelled first, so
  /// callers cancel the child when they are done with it.
  pub(crate) fn cancelled_by(&self, trigger: CancellationToken) -> Self {
    let child = Self {
      job_name: self.job_name.clone(),
      firing_id: self.firing_id,
      token: self.token.child_token(),
      deadline: self.deadline,
    };
    if trigger.is_cancelled() {
      child.token.cancel();
      return child;
    }
    let relay = child.token.clone();
    tokio::spawn(async move {
      tokio::select! {
        _ = trigger.cancelled() => relay.cancel(),
        _ = relay.cancelled() => {}
      }
    });
    child
  }

  /// Cancels this context and every context derived from it.
  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Time left before the deadline, `None` when there is no deadline.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .deadline
      .map(|d| d.saturating_duration_since(Instant::now()))
  }

  pub fn is_cancelled(&self) -> bool {
    self.done_reason().is_some()
  }

  /// Returns why the context is done, or `None` while it is still live.
  pub fn done_reason(&self) -> Option<DoneReason> {
    if self.token.is_cancelled() {
      return Some(DoneReason::Cancelled);
    }
    match self.deadline {
      Some(deadline) if Instant::now() >= deadline => Some(DoneReason::DeadlineExceeded),
      _ => None,
    }
  }

  /// Convenience for job bodies: `ctx.check()?` between units of work.
  pub fn check(&self) -> Result<(), JobError> {
    match self.done_reason() {
      Some(reason) => Err(reason.into()),
      None => Ok(()),
    }
  }

  /// Resolves once the context is cancelled or its deadline passes.
  pub async fn done(&self) -> DoneReason {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          _ = self.token.cancelled() => DoneReason::Cancelled,
          _ = tokio::time::sleep_until(deadline) => DoneReason::DeadlineExceeded,
        }
      }
      None => {
        self.token.cancelled().await;
        DoneReason::Cancelled
      }
    }
  }

  /// Sleeps for `duration` unless the context finishes first.
  pub async fn sleep(&self, duration: Duration) -> Result<(), DoneReason> {
    if let Some(reason) = self.done_reason() {
      return Err(reason);
    }
    tokio::select! {
      biased;
      reason = self.done() => Err(reason),
      _ = tokio::time::sleep(duration) => Ok(()),
    }
  }

  /// The underlying token, for handing to APIs that take one directly.
  pub fn token(&self) -> &CancellationToken {
    &self.token
  }
}

// --- Task-local access ---

#[cfg(feature = "job_context")]
tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the manager for every firing if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the `JobContext` of the firing running on this task.
///
/// Requires the `job_context` feature. Returns `None` when called outside a
/// manager-driven execution.
#[cfg(feature = "job_context")]
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the running firing's `JobContext`.
///
/// # Panics
///
/// Panics when called outside a manager-driven execution. Use
/// [`try_get_current_job_context`] when the context may be absent.
#[cfg(feature = "job_context")]
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn deadline_marks_context_done() {
    let root = JobContext::background();
    let ctx = root.for_firing("sync", Some(Duration::from_secs(5)));
    assert!(ctx.check().is_ok());
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(ctx.done_reason(), Some(DoneReason::DeadlineExceeded));
    assert!(!root.is_cancelled());
  }

  #[tokio::test]
  async fn parent_cancel_propagates() {
    let root = JobContext::background();
    let ctx = root.for_firing("sync", None);
    root.cancel();
    assert_eq!(ctx.done().await, DoneReason::Cancelled);
    assert!(ctx.sleep(Duration::from_secs(60)).await.is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn child_deadline_never_exceeds_parent() {
    let root = JobContext::background();
    let parent = root.for_firing("sync", Some(Duration::from_secs(1)));
    let child = parent.with_timeout(Duration::from_secs(30));
    assert_eq!(child.deadline(), parent.deadline());
    assert_eq!(child.firing_id, parent.firing_id);
  }

  #[tokio::test]
  async fn trigger_cancels_derived_context_only() {
    let root = JobContext::background();
    let ctx = root.for_firing("sync", Some(Duration::from_secs(60)));
    let trigger = CancellationToken::new();
    let run = ctx.cancelled_by(trigger.clone());
    assert_eq!(run.deadline(), ctx.deadline());
    assert_eq!(run.firing_id, ctx.firing_id);
    assert!(!run.is_cancelled());

    trigger.cancel();
    assert_eq!(run.done().await, DoneReason::Cancelled);
    assert!(!ctx.is_cancelled());
  }

  #[test]
  fn done_reason_display() {
    assert_eq!(DoneReason::Cancelled.to_string(), "context cancelled");
    assert_eq!(DoneReason::DeadlineExceeded.to_string(), "deadline exceeded");
  }
}
