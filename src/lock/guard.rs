use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::LockManager;
use crate::error::LockError;
use crate::job::JobContext;

/// Scoped holder of one named lock.
///
/// Call [`LockGuard::release`] on every exit path. If a guard is dropped while
/// still holding its lock (a panic unwound past it, or the owning future was
/// dropped), the release is spawned onto the current runtime instead.
///
/// While held, [`LockGuard::lease`] is cancelled if the lock is lost with its
/// session.
#[derive(Debug)]
pub struct LockGuard {
  locks: Arc<LockManager>,
  name: String,
  lease: Option<CancellationToken>,
}

impl LockGuard {
  /// Creates an unacquired guard for `name`. No store call is made.
  pub fn new(locks: Arc<LockManager>, name: impl Into<String>) -> Self {
    Self {
      locks,
      name: name.into(),
      lease: None,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Single non-blocking attempt. Fails fast with `LockError::Cancelled` when
  /// `ctx` is already done.
  pub async fn acquire(&mut self, ctx: &JobContext) -> Result<bool, LockError> {
    if let Some(reason) = ctx.done_reason() {
      return Err(LockError::Cancelled(reason));
    }
    if self.lease.is_some() {
      return Ok(true);
    }
    self.lease = self.locks.acquire_lease(&self.name).await?;
    Ok(self.lease.is_some())
  }

  /// Polls for up to `timeout`. Running out of time is reported as
  /// `Ok(false)`, so callers treat it exactly like contention.
  pub async fn acquire_with_timeout(
    &mut self,
    ctx: &JobContext,
    timeout: Duration,
  ) -> Result<bool, LockError> {
    if let Some(reason) = ctx.done_reason() {
      return Err(LockError::Cancelled(reason));
    }
    if self.lease.is_some() {
      return Ok(true);
    }
    match self
      .locks
      .acquire_lease_with_timeout(&self.name, timeout, ctx)
      .await
    {
      Ok(lease) => {
        self.lease = Some(lease);
        Ok(true)
      }
      Err(LockError::Timeout { waited, .. }) => {
        debug!(lock = %self.name, waited_ms = waited.as_millis() as u64, "Lock wait timed out.");
        Ok(false)
      }
      Err(e) => Err(e),
    }
  }

  /// Releases the lock if held. A second call is a no-op, and so is
  /// releasing a lock that was already lost with its session.
  pub async fn release(&mut self) -> Result<(), LockError> {
    match self.lease.take() {
      Some(lease) if !lease.is_cancelled() => self.locks.release_lock(&self.name).await,
      _ => Ok(()),
    }
  }

  pub fn is_acquired(&self) -> bool {
    self.lease.is_some()
  }

  /// The lease of the held lock, `None` before acquisition.
  pub fn lease(&self) -> Option<&CancellationToken> {
    self.lease.as_ref()
  }

  /// `true` once a held lock has been lost with its session.
  pub fn is_lost(&self) -> bool {
    self.lease.as_ref().is_some_and(|lease| lease.is_cancelled())
  }
}

impl Drop for LockGuard {
  fn drop(&mut self) {
    match self.lease.take() {
      Some(lease) if !lease.is_cancelled() => {}
      _ => return,
    }
    let locks = self.locks.clone();
    let name = std::mem::take(&mut self.name);
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        warn!(lock = %name, "Lock guard dropped while held; releasing in background.");
        handle.spawn(async move {
          if let Err(e) = locks.release_lock(&name).await {
            warn!(lock = %name, error = %e, "Background lock release failed.");
          }
        });
      }
      Err(_) => {
        warn!(lock = %name, "Lock guard dropped outside a runtime; the store releases it when the session ends.");
      }
    }
  }
}
