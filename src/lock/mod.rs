//! Named, distributed, non-reentrant locks.
//!
//! A [`LockManager`] maps job names to advisory-lock keys and routes every
//! acquire and release through one pinned [`LockSession`]. Pinning matters:
//! database advisory locks belong to the session that took them, so routing
//! acquire and release independently through a pool can release nothing, or
//! leak a lock until a pooled connection happens to be recycled.

mod guard;
#[cfg(feature = "postgres")]
mod postgres;
mod store;

pub use guard::LockGuard;
#[cfg(feature = "postgres")]
pub use postgres::PgLockStore;
pub use store::{LockKey, LockSession, LockStore, MemoryLockStore};

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LockError;
use crate::job::{DoneReason, JobContext};

/// Poll interval used while waiting for a contended lock.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on a single backing-store call, including the wait for the
/// session itself. A call that overruns it is abandoned with its session.
pub const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Derives the advisory-lock key for `name`.
///
/// SHA-256 of the UTF-8 name, first 8 bytes read as a big-endian `i64`, negated
/// when negative. `i64::MIN` has no positive counterpart and maps to `i64::MAX`.
pub fn lock_key(name: &str) -> LockKey {
  let digest = Sha256::digest(name.as_bytes());
  let mut prefix = [0u8; 8];
  prefix.copy_from_slice(&digest[..8]);
  let key = i64::from_be_bytes(prefix);
  if key < 0 {
    key.checked_neg().unwrap_or(i64::MAX)
  } else {
    key
  }
}

struct SessionState {
  session: Option<Box<dyn LockSession>>,
  // Names this manager currently holds, each with the lease handed to its
  // holder. Also refuses a second local acquire even though the store would
  // grant it to the same session.
  held: HashMap<String, CancellationToken>,
  // Releases that failed while the session stayed up; the store still holds
  // them for us, so they are retried before the next store call.
  pending_release: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
enum Op {
  Acquire,
  Release,
  Inspect,
}

enum Outcome {
  Acquired(CancellationToken),
  Contended,
  Released,
  NotHeld,
  Locked,
  Free,
}

enum Interrupt {
  Done(DoneReason),
  Elapsed,
}

// Wait window of `acquire_lock_with_timeout`: when it started, when it ends.
type WaitWindow = (Instant, Instant);

async fn interrupted(ctx: Option<&JobContext>, deadline: Instant) -> Interrupt {
  match ctx {
    Some(ctx) => tokio::select! {
      reason = ctx.done() => Interrupt::Done(reason),
      _ = tokio::time::sleep_until(deadline) => Interrupt::Elapsed,
    },
    None => {
      tokio::time::sleep_until(deadline).await;
      Interrupt::Elapsed
    }
  }
}

/// Distributed lock manager over one pinned backing-store session.
///
/// Every acquisition hands out a lease: a [`CancellationToken`] that is
/// cancelled if the session dies while the lock is held, since the store
/// releases the lock at that moment. Plain store errors (an unreachable
/// database, a statement timeout) leave the session and its locks in place.
pub struct LockManager {
  store: Arc<dyn LockStore>,
  state: Mutex<SessionState>,
  poll_interval: Duration,
  call_timeout: Duration,
}

impl fmt::Debug for LockManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockManager")
      .field("store", &format_args!("Arc<dyn LockStore>"))
      .field("poll_interval", &self.poll_interval)
      .field("call_timeout", &self.call_timeout)
      .finish()
  }
}

impl LockManager {
  /// Creates a manager; the session is opened lazily on first use.
  pub fn new(store: Arc<dyn LockStore>) -> Self {
    Self {
      store,
      state: Mutex::new(SessionState {
        session: None,
        held: HashMap::new(),
        pending_release: HashSet::new(),
      }),
      poll_interval: LOCK_POLL_INTERVAL,
      call_timeout: STORE_CALL_TIMEOUT,
    }
  }

  /// Overrides the polling interval used by [`Self::acquire_lock_with_timeout`].
  pub fn with_poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval.max(Duration::from_millis(1));
    self
  }

  /// Overrides [`STORE_CALL_TIMEOUT`].
  pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
    self.call_timeout = timeout.max(Duration::from_millis(1));
    self
  }

  /// Non-blocking acquisition attempt.
  ///
  /// `Ok(true)` when newly acquired, `Ok(false)` when another holder (including
  /// another caller in this process) holds it, `Err` only on infrastructure
  /// failure.
  pub async fn acquire_lock(&self, name: &str) -> Result<bool, LockError> {
    Ok(self.acquire_lease(name).await?.is_some())
  }

  /// Like [`Self::acquire_lock`], returning the lease on success.
  pub async fn acquire_lease(&self, name: &str) -> Result<Option<CancellationToken>, LockError> {
    match self.run(Op::Acquire, name, None, None).await? {
      Outcome::Acquired(lease) => Ok(Some(lease)),
      _ => Ok(None),
    }
  }

  /// Releases `name`. Not holding it is logged, not returned as an error.
  ///
  /// When the store call fails but the session survives, the lock stays held
  /// by the store and the release is retried ahead of the next store call.
  pub async fn release_lock(&self, name: &str) -> Result<(), LockError> {
    match self.run(Op::Release, name, None, None).await? {
      Outcome::NotHeld => warn!(
        lock = name,
        lock_key = lock_key(name),
        "Release requested for a lock this session does not hold."
      ),
      _ => debug!(lock = name, lock_key = lock_key(name), "Released lock."),
    }
    Ok(())
  }

  /// Whether `name` is currently held by anyone.
  ///
  /// Costs one extra round trip when the lock turns out to be free: it is
  /// acquired and released immediately.
  pub async fn is_locked(&self, name: &str) -> Result<bool, LockError> {
    match self.run(Op::Inspect, name, None, None).await? {
      Outcome::Locked => Ok(true),
      _ => Ok(false),
    }
  }

  /// Tries once, then polls until acquired, `timeout` elapses
  /// (`LockError::Timeout`) or `ctx` is done (`LockError::Cancelled`).
  ///
  /// Store calls made while waiting are bounded by the same limits, so a hung
  /// store cannot hold the caller past them.
  pub async fn acquire_lock_with_timeout(
    &self,
    name: &str,
    timeout: Duration,
    ctx: &JobContext,
  ) -> Result<bool, LockError> {
    self
      .acquire_lease_with_timeout(name, timeout, ctx)
      .await
      .map(|_| true)
  }

  /// Like [`Self::acquire_lock_with_timeout`], returning the lease.
  pub async fn acquire_lease_with_timeout(
    &self,
    name: &str,
    timeout: Duration,
    ctx: &JobContext,
  ) -> Result<CancellationToken, LockError> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
      if let Some(reason) = ctx.done_reason() {
        return Err(LockError::Cancelled(reason));
      }
      let outcome = self
        .run(Op::Acquire, name, Some(ctx), Some((started, deadline)))
        .await?;
      if let Outcome::Acquired(lease) = outcome {
        return Ok(lease);
      }
      let now = Instant::now();
      if now >= deadline {
        info!(
          lock = name,
          waited_ms = started.elapsed().as_millis() as u64,
          "Timed out waiting for lock."
        );
        return Err(LockError::Timeout {
          name: name.to_string(),
          waited: started.elapsed(),
        });
      }
      let wait = self.poll_interval.min(deadline - now);
      if let Err(reason) = ctx.sleep(wait).await {
        return Err(LockError::Cancelled(reason));
      }
    }
  }

  /// Names currently held through this manager.
  pub async fn held_locks(&self) -> Vec<String> {
    let state = self.state.lock().await;
    let mut names: Vec<String> = state.held.keys().cloned().collect();
    names.sort();
    names
  }

  // Runs one operation against the session, bounded by `ctx`, the caller's
  // wait window (never cutting a call shorter than one poll interval) and the
  // call timeout.
  async fn run(
    &self,
    op: Op,
    name: &str,
    ctx: Option<&JobContext>,
    wait: Option<WaitWindow>,
  ) -> Result<Outcome, LockError> {
    let key = lock_key(name);
    let now = Instant::now();
    let mut call_deadline = now + self.call_timeout;
    if let Some((_, wait_deadline)) = wait {
      call_deadline = call_deadline.min(wait_deadline.max(now + self.poll_interval));
    }

    let locked = tokio::select! {
      biased;
      state = self.state.lock() => Ok(state),
      interrupt = interrupted(ctx, call_deadline) => Err(interrupt),
    };
    let mut state = match locked {
      Ok(state) => state,
      Err(interrupt) => return Err(self.interrupted_error(interrupt, name, wait, false)),
    };

    let finished = {
      let call = Self::apply(&self.store, &mut state, op, name, key);
      tokio::select! {
        biased;
        result = call => Ok(result),
        interrupt = interrupted(ctx, call_deadline) => Err(interrupt),
      }
    };
    let result = match finished {
      Ok(result) => result,
      Err(interrupt) => {
        // The abandoned call may still be in flight on the session.
        let err = self.interrupted_error(interrupt, name, wait, true);
        warn!(lock = name, lock_key = key, op = ?op, error = %err, "Abandoned lock store call.");
        Self::discard_session(&mut state, &err);
        return Err(err);
      }
    };

    if let Err(e) = &result {
      match op {
        Op::Acquire => error!(lock = name, lock_key = key, error = %e, "Lock acquisition failed."),
        Op::Release => error!(lock = name, lock_key = key, error = %e, "Lock release failed."),
        Op::Inspect => error!(lock = name, lock_key = key, error = %e, "Lock status check failed."),
      }
      if e.is_session_lost() {
        Self::discard_session(&mut state, e);
      }
    }
    result
  }

  async fn apply(
    store: &Arc<dyn LockStore>,
    state: &mut SessionState,
    op: Op,
    name: &str,
    key: LockKey,
  ) -> Result<Outcome, LockError> {
    let SessionState {
      session,
      held,
      pending_release,
    } = state;

    let tracked = match op {
      Op::Acquire if held.contains_key(name) => {
        debug!(lock = name, lock_key = key, "Lock already held by this manager.");
        return Ok(Outcome::Contended);
      }
      Op::Inspect if held.contains_key(name) => return Ok(Outcome::Locked),
      Op::Release => {
        let tracked = held.remove(name).is_some() || pending_release.contains(name);
        if tracked {
          pending_release.insert(name.to_string());
        } else if session.is_none() {
          // No session, so nothing of ours is held in the store.
          return Ok(Outcome::NotHeld);
        }
        tracked
      }
      _ => false,
    };

    let session = Self::session(store, session).await?;
    Self::flush_releases(session, pending_release).await?;

    match op {
      Op::Acquire => {
        if session.try_lock(key).await? {
          let lease = CancellationToken::new();
          held.insert(name.to_string(), lease.clone());
          debug!(lock = name, lock_key = key, "Acquired lock.");
          Ok(Outcome::Acquired(lease))
        } else {
          debug!(lock = name, lock_key = key, "Lock held elsewhere.");
          Ok(Outcome::Contended)
        }
      }
      Op::Release if tracked => Ok(Outcome::Released),
      Op::Release => match session.unlock(key).await? {
        true => Ok(Outcome::Released),
        false => Ok(Outcome::NotHeld),
      },
      Op::Inspect => {
        if !session.try_lock(key).await? {
          return Ok(Outcome::Locked);
        }
        if let Err(e) = session.unlock(key).await {
          pending_release.insert(name.to_string());
          return Err(e);
        }
        Ok(Outcome::Free)
      }
    }
  }

  async fn flush_releases(
    session: &mut Box<dyn LockSession>,
    pending: &mut HashSet<String>,
  ) -> Result<(), LockError> {
    let names: Vec<String> = pending.iter().cloned().collect();
    for name in names {
      let released = session.unlock(lock_key(&name)).await?;
      pending.remove(&name);
      debug!(lock = %name, released, "Completed deferred lock release.");
    }
    Ok(())
  }

  async fn session<'a>(
    store: &Arc<dyn LockStore>,
    slot: &'a mut Option<Box<dyn LockSession>>,
  ) -> Result<&'a mut Box<dyn LockSession>, LockError> {
    if slot.is_none() {
      *slot = Some(store.open_session().await?);
    }
    slot
      .as_mut()
      .ok_or_else(|| LockError::store("lock session unavailable"))
  }

  fn interrupted_error(
    &self,
    interrupt: Interrupt,
    name: &str,
    wait: Option<WaitWindow>,
    in_call: bool,
  ) -> LockError {
    match (interrupt, wait) {
      (Interrupt::Done(reason), _) => LockError::Cancelled(reason),
      (Interrupt::Elapsed, Some((started, deadline))) if Instant::now() >= deadline => {
        LockError::Timeout {
          name: name.to_string(),
          waited: started.elapsed(),
        }
      }
      (Interrupt::Elapsed, _) if in_call => LockError::session_lost(format!(
        "lock store call did not complete within {:?}",
        self.call_timeout
      )),
      (Interrupt::Elapsed, _) => LockError::store(format!(
        "lock session busy for more than {:?}",
        self.call_timeout
      )),
    }
  }

  // A lost session took every lock it held with it: the store has released
  // them. Their holders are told through their leases, and the next call
  // opens a fresh session.
  fn discard_session(state: &mut SessionState, cause: &LockError) {
    state.session = None;
    state.pending_release.clear();
    if !state.held.is_empty() {
      let mut lost: Vec<&String> = state.held.keys().collect();
      lost.sort();
      warn!(
        ?lost,
        error = %cause,
        "Lock session lost; locks it held were released by the store."
      );
    }
    for (_, lease) in state.held.drain() {
      lease.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn manager(store: &MemoryLockStore) -> LockManager {
    LockManager::new(Arc::new(store.clone()))
  }

  #[test]
  fn key_is_deterministic_and_positive() {
    let names = ["sync", "sync_prices", "refresh_views", "cleanup", "", "Sync"];
    let keys: Vec<LockKey> = names.iter().map(|n| lock_key(n)).collect();
    for (name, key) in names.iter().zip(&keys) {
      assert_eq!(lock_key(name), *key);
      assert!(*key >= 0, "key for {:?} must be non-negative", name);
    }
    let unique: HashSet<_> = keys.iter().collect();
    assert_eq!(unique.len(), keys.len());
  }

  #[test]
  fn key_matches_digest_prefix() {
    let digest = Sha256::digest(b"sync");
    let raw = i64::from_be_bytes(digest[..8].try_into().unwrap());
    let expected = if raw < 0 { -raw } else { raw };
    assert_eq!(lock_key("sync"), expected);
  }

  #[tokio::test]
  async fn acquire_is_not_reentrant() {
    let store = MemoryLockStore::new();
    let locks = manager(&store);
    assert!(locks.acquire_lock("sync").await.unwrap());
    assert!(!locks.acquire_lock("sync").await.unwrap());
    assert_eq!(locks.held_locks().await, vec!["sync".to_string()]);
    locks.release_lock("sync").await.unwrap();
    assert!(!store.is_held(lock_key("sync")));
  }

  #[tokio::test]
  async fn release_of_unheld_lock_is_ok() {
    let store = MemoryLockStore::new();
    let locks = manager(&store);
    locks.release_lock("never-taken").await.unwrap();
  }

  #[tokio::test]
  async fn store_outage_keeps_session_and_locks() {
    let store = MemoryLockStore::new();
    let locks = manager(&store);
    let lease = locks.acquire_lease("a").await.unwrap().unwrap();
    store.set_unavailable(true);
    let err = locks.acquire_lock("b").await.unwrap_err();
    assert!(err.is_store());
    assert!(!err.is_session_lost());
    assert!(locks.is_locked("c").await.is_err());

    assert_eq!(locks.held_locks().await, vec!["a".to_string()]);
    assert!(store.is_held(lock_key("a")));
    assert!(!lease.is_cancelled());

    store.set_unavailable(false);
    assert!(locks.acquire_lock("b").await.unwrap());
    assert!(!locks.acquire_lock("a").await.unwrap());
  }

  #[tokio::test]
  async fn lost_session_cancels_leases() {
    let store = MemoryLockStore::new();
    let locks = manager(&store);
    let a = locks.acquire_lease("a").await.unwrap().unwrap();
    let b = locks.acquire_lease("b").await.unwrap().unwrap();
    store.terminate_sessions();

    assert!(locks.is_locked("c").await.unwrap_err().is_session_lost());
    assert!(a.is_cancelled());
    assert!(b.is_cancelled());
    assert!(locks.held_locks().await.is_empty());

    // The next call opens a fresh session.
    assert!(locks.acquire_lock("a").await.unwrap());
  }

  #[tokio::test]
  async fn failed_release_is_retried() {
    let store = MemoryLockStore::new();
    let locks = manager(&store);
    assert!(locks.acquire_lock("a").await.unwrap());
    store.set_unavailable(true);
    assert!(locks.release_lock("a").await.unwrap_err().is_store());
    assert!(locks.held_locks().await.is_empty());
    assert!(store.is_held(lock_key("a")));

    store.set_unavailable(false);
    assert!(!locks.is_locked("a").await.unwrap());
    assert!(!store.is_held(lock_key("a")));
  }
}
