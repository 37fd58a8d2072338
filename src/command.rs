use std::fmt;

/// Represents the requested shutdown mode. Sent to the trigger engine via a
/// `watch` channel; `None` means the manager is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop scheduling new firings and wait for in-flight ones to finish.
  Graceful,
  /// Cancel every in-flight firing's context, then wait for them to return.
  Force,
}

/// What started a firing. Recorded on the firing's tracing span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FiringOrigin {
  /// The trigger engine reached the job's next scheduled time.
  Scheduled,
  /// The job was selected to run when the manager started.
  Startup,
  /// `JobManager::trigger_job_now`.
  Manual,
}

impl fmt::Display for FiringOrigin {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      FiringOrigin::Scheduled => "scheduled",
      FiringOrigin::Startup => "startup",
      FiringOrigin::Manual => "manual",
    })
  }
}
