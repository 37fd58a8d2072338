use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::job::DoneReason;

/// Boxed error used to carry backing-store and job-level causes.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

// --- Registration Errors ---

/// Errors returned by `JobManager::register_job` and its variants.
///
/// Registration errors are meant to abort process initialization: a job that
/// cannot be scheduled is never silently dropped.
#[derive(Error, Debug)]
pub enum RegisterError {
  #[error("Job name must not be empty")]
  EmptyName,
  #[error("A job named '{0}' is already registered")]
  DuplicateName(String),
  #[error("Job '{name}' has an invalid schedule: {source}")]
  InvalidSchedule {
    name: String,
    #[source]
    source: ScheduleError,
  },
  #[error("Jobs cannot be registered after the manager has been started")]
  AlreadyStarted,
}

// --- Schedule Errors ---

/// Errors produced while parsing a schedule expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error("schedule expression is empty")]
  Empty,
  #[error("invalid '@every' duration '{0}'")]
  InvalidEvery(String),
  #[error("unknown schedule descriptor '{0}'")]
  UnknownDescriptor(String),
  #[error("expected 5, 6 or 7 fields, found {0}")]
  FieldCount(usize),
  #[error("invalid cron expression '{expression}': {reason}")]
  InvalidCron { expression: String, reason: String },
}

// --- Lock Errors ---

/// Errors from the distributed lock layer.
///
/// Lock contention is never an error; it is reported as `Ok(false)` by the
/// acquisition calls. Only infrastructure failures, lock-wait timeouts and
/// cancellation surface here.
#[derive(Error, Debug)]
pub enum LockError {
  /// The store call failed. `session_lost` is set when the pinned session is
  /// gone (connection dropped, call abandoned), which also means every lock it
  /// held has been released by the store.
  #[error("lock store unavailable: {source}")]
  Store {
    #[source]
    source: BoxError,
    session_lost: bool,
  },
  #[error("lock '{name}' not acquired within {waited:?}")]
  Timeout { name: String, waited: Duration },
  #[error("lock wait interrupted: {0}")]
  Cancelled(DoneReason),
}

impl LockError {
  /// Wraps a failed store call after which the session is still usable.
  pub fn store<E>(err: E) -> Self
  where
    E: Into<BoxError>,
  {
    LockError::Store {
      source: err.into(),
      session_lost: false,
    }
  }

  /// Wraps a failure that ended the session.
  pub fn session_lost<E>(err: E) -> Self
  where
    E: Into<BoxError>,
  {
    LockError::Store {
      source: err.into(),
      session_lost: true,
    }
  }

  /// `true` for genuine infrastructure failures (the store is unreachable).
  pub fn is_store(&self) -> bool {
    matches!(self, LockError::Store { .. })
  }

  pub fn is_session_lost(&self) -> bool {
    matches!(self, LockError::Store { session_lost: true, .. })
  }
}

// --- Job Errors ---

/// Classification tag carried by every [`JobError`].
///
/// Retry decisions consult the kind (through [`JobError::is_retryable`]) rather
/// than the concrete cause, so new failure sources only need to pick a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
  /// A failure expected to clear on its own (network blip, busy upstream).
  Transient,
  /// A failure that will not change on retry (bad data, missing config).
  Permanent,
  /// The upstream asked us to slow down.
  RateLimited,
  /// The execution handle was cancelled.
  Cancelled,
  /// The execution handle's deadline passed.
  DeadlineExceeded,
  /// The lock store failed while acquiring or releasing the job lock.
  Lock,
  /// The job lock was held elsewhere and the policy does not skip.
  LockNotAcquired,
  /// The job body panicked.
  Panicked,
}

impl ErrorKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Transient => "transient",
      ErrorKind::Permanent => "permanent",
      ErrorKind::RateLimited => "rate_limited",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::DeadlineExceeded => "deadline_exceeded",
      ErrorKind::Lock => "lock",
      ErrorKind::LockNotAcquired => "lock_not_acquired",
      ErrorKind::Panicked => "panicked",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Failure returned by `Job::execute`.
#[derive(Error, Debug)]
#[error("{message} ({kind})")]
pub struct JobError {
  kind: ErrorKind,
  message: String,
  #[source]
  source: Option<BoxError>,
}

impl JobError {
  pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      source: None,
    }
  }

  pub fn transient(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Transient, message)
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Permanent, message)
  }

  pub fn rate_limited(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::RateLimited, message)
  }

  pub fn cancelled() -> Self {
    Self::new(ErrorKind::Cancelled, "execution cancelled")
  }

  pub fn deadline_exceeded() -> Self {
    Self::new(ErrorKind::DeadlineExceeded, "execution deadline exceeded")
  }

  pub fn panicked(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Panicked, message)
  }

  /// Attaches an underlying cause.
  pub fn with_source<E>(mut self, source: E) -> Self
  where
    E: Into<BoxError>,
  {
    self.source = Some(source.into());
    self
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  pub fn message(&self) -> &str {
    &self.message
  }

  /// Whether a retrying decorator may run the job again after this failure.
  ///
  /// Cancellation, deadline expiry, permanent failures, lock failures and panics
  /// are never retried.
  pub fn is_retryable(&self) -> bool {
    matches!(self.kind, ErrorKind::Transient | ErrorKind::RateLimited)
  }

  /// `true` for cancellation and deadline expiry.
  pub fn is_cancellation(&self) -> bool {
    matches!(self.kind, ErrorKind::Cancelled | ErrorKind::DeadlineExceeded)
  }

  pub fn is_rate_limited(&self) -> bool {
    self.kind == ErrorKind::RateLimited
  }
}

impl From<LockError> for JobError {
  fn from(err: LockError) -> Self {
    match err {
      LockError::Cancelled(reason) => reason.into(),
      LockError::Timeout { ref name, waited } => JobError::new(
        ErrorKind::LockNotAcquired,
        format!("lock '{}' not acquired within {:?}", name, waited),
      ),
      LockError::Store { .. } => {
        JobError::new(ErrorKind::Lock, "lock store failure").with_source(err)
      }
    }
  }
}

// --- Lifecycle Errors ---

/// Errors from `ManagerBuilder::build`.
#[derive(Error, Debug)]
pub enum BuildError {
  #[error("No lock store configured: supply a lock store, a lock manager or a database URL")]
  MissingLockStore,
  #[error("Failed to configure the lock store: {0}")]
  LockStore(#[from] LockError),
}

/// Errors from `JobManager::start`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
  #[error("Job manager is already started or has been stopped")]
  AlreadyStarted,
  #[error("Job manager must be started from within a Tokio runtime")]
  NoRuntime,
}

/// Errors related to the manager shutdown process (`stop`, `stop_with_timeout`, `stop_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out waiting for in-flight job executions to complete.")]
  Timeout,
  #[error("The trigger engine task panicked during the shutdown process.")]
  TaskPanic,
}

// --- Query Errors ---

/// Errors from read-only manager introspection.
#[derive(Error, Debug)]
pub enum QueryError {
  #[error("Job '{0}' not found.")]
  JobNotFound(String),
  #[error(transparent)]
  Lock(#[from] LockError),
}

/// Errors from manually running a job (`trigger_job_now`, `run_job_once`).
#[derive(Error, Debug)]
pub enum TriggerError {
  #[error("Job '{0}' not found.")]
  JobNotFound(String),
  #[error("Job '{name}' failed: {source}")]
  Job {
    name: String,
    #[source]
    source: JobError,
  },
  #[error("Job execution task for '{0}' panicked or was aborted.")]
  TaskPanic(String),
}

// --- Config Errors ---

/// Errors loading [`crate::config::ManagerConfig`] from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("missing required environment variable {0}")]
  Missing(&'static str),
  #[error("invalid value for {key}: {value}")]
  Invalid { key: &'static str, value: String },
}
