pub mod context;

pub use context::{DoneReason, FiringId, JobContext};

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::error::JobError;

// --- Public Type Aliases ---

/// The function type executed by an [`FnJob`].
///
/// The function receives an owned [`JobContext`] for the firing and returns a
/// boxed `Send` future. Build one by hand or with the [`job_fn!`](crate::job_fn)
/// macro.
pub type BoxedExecFn = Box<
  dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<(), JobError>> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

// --- Job Contract ---

/// A named, scheduled unit of background work.
///
/// The name identifies the job for registration, status and locking, and must
/// stay the same for the lifetime of the process. Two jobs with the same name
/// share one distributed lock.
#[async_trait]
pub trait Job: Send + Sync {
  fn name(&self) -> &str;

  /// Schedule expression, see [`crate::schedule::Schedule::parse`].
  fn schedule(&self) -> &str;

  /// Performs one execution. Implementations should observe `ctx` at their
  /// suspension points and give up once it is done.
  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;

  /// Whether the manager also runs this job once at `start`.
  fn run_on_startup(&self) -> bool {
    false
  }

  /// `true` for decorators that already apply lock and retry policy, so the
  /// manager does not wrap them a second time.
  fn is_retrying(&self) -> bool {
    false
  }
}

// --- Closure-backed Job ---

/// A [`Job`] built from a name, a schedule and a closure.
pub struct FnJob {
  name: String,
  schedule: String,
  exec_fn: BoxedExecFn,
  startup: bool,
}

impl FnJob {
  pub fn new(name: impl Into<String>, schedule: impl Into<String>, exec_fn: BoxedExecFn) -> Self {
    Self {
      name: name.into(),
      schedule: schedule.into(),
      exec_fn,
      startup: false,
    }
  }

  /// Marks the job to run once when the manager starts.
  pub fn with_startup(mut self, startup: bool) -> Self {
    self.startup = startup;
    self
  }
}

impl fmt::Debug for FnJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnJob")
      .field("name", &self.name)
      .field("schedule", &self.schedule)
      .field("startup", &self.startup)
      .finish_non_exhaustive()
  }
}

#[async_trait]
impl Job for FnJob {
  fn name(&self) -> &str {
    &self.name
  }

  fn schedule(&self) -> &str {
    &self.schedule
  }

  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
    (self.exec_fn)(ctx.clone()).await
  }

  fn run_on_startup(&self) -> bool {
    self.startup
  }
}

// --- Status ---

/// Point-in-time view of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobStatus {
  pub name: String,
  pub schedule: String,
  /// Whether the job's lock is held anywhere at the time of the query.
  pub locked: bool,
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
