//! Backing-store boundary for advisory locks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::LockError;

/// Numeric advisory-lock key.
pub type LockKey = i64;

/// One pinned session on the backing store.
///
/// Locks taken through a session belong to that session: they can only be
/// released through it, and they are released by the store when the session
/// ends. At the store level a session may hold the same key more than once
/// (each `try_lock` must then be paired with an `unlock`).
#[async_trait]
pub trait LockSession: Send {
  /// Non-blocking attempt; `Ok(false)` when another session holds `key`.
  async fn try_lock(&mut self, key: LockKey) -> Result<bool, LockError>;

  /// Releases one hold of `key`; `Ok(false)` when this session did not hold it.
  async fn unlock(&mut self, key: LockKey) -> Result<bool, LockError>;
}

/// Factory for [`LockSession`]s.
#[async_trait]
pub trait LockStore: Send + Sync {
  async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError>;
}

// --- In-memory store ---

type SessionId = u64;

#[derive(Debug, Default)]
struct MemoryTable {
  holders: HashMap<LockKey, (SessionId, usize)>,
}

#[derive(Debug, Default)]
struct MemoryInner {
  table: Mutex<MemoryTable>,
  next_session: AtomicU64,
  // Sessions with an id below this were ended by the store.
  terminated_below: AtomicU64,
  unavailable: AtomicBool,
}

/// Process-local lock store with the same session semantics as a database.
///
/// Clones share state, so several `LockManager`s (standing in for several
/// service replicas) can contend over one `MemoryLockStore`.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
  inner: Arc<MemoryInner>,
}

impl MemoryLockStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Simulates the store becoming unreachable (or reachable again).
  /// While unavailable every session call fails with `LockError::Store`.
  pub fn set_unavailable(&self, unavailable: bool) {
    self.inner.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Ends every open session, as a database restart or a killed backend
  /// would. Their locks are released; further calls on them fail with a
  /// session-lost `LockError::Store`. New sessions are unaffected.
  pub fn terminate_sessions(&self) {
    let watermark = self.inner.next_session.load(Ordering::SeqCst);
    self.inner.terminated_below.store(watermark, Ordering::SeqCst);
    let mut table = self.inner.table.lock();
    table.holders.retain(|_, (holder, _)| *holder >= watermark);
    debug!(terminated_below = watermark, "Terminated memory lock sessions.");
  }

  /// Whether any session currently holds `key`.
  pub fn is_held(&self, key: LockKey) -> bool {
    self.inner.table.lock().holders.contains_key(&key)
  }

  /// Number of keys currently held by any session.
  pub fn held_count(&self) -> usize {
    self.inner.table.lock().holders.len()
  }

  fn check_available(&self) -> Result<(), LockError> {
    if self.inner.unavailable.load(Ordering::SeqCst) {
      Err(LockError::store("memory lock store marked unavailable"))
    } else {
      Ok(())
    }
  }

  fn check_session(&self, id: SessionId) -> Result<(), LockError> {
    if id < self.inner.terminated_below.load(Ordering::SeqCst) {
      return Err(LockError::session_lost(format!(
        "memory lock session {} was terminated",
        id
      )));
    }
    self.check_available()
  }
}

#[async_trait]
impl LockStore for MemoryLockStore {
  async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
    self.check_available()?;
    let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
    debug!(session_id = id, "Opened memory lock session.");
    Ok(Box::new(MemorySession {
      id,
      store: self.clone(),
    }))
  }
}

struct MemorySession {
  id: SessionId,
  store: MemoryLockStore,
}

#[async_trait]
impl LockSession for MemorySession {
  async fn try_lock(&mut self, key: LockKey) -> Result<bool, LockError> {
    self.store.check_session(self.id)?;
    let mut table = self.store.inner.table.lock();
    let (holder, count) = table.holders.entry(key).or_insert((self.id, 0));
    if *holder == self.id {
      *count += 1;
      Ok(true)
    } else {
      Ok(false)
    }
  }

  async fn unlock(&mut self, key: LockKey) -> Result<bool, LockError> {
    self.store.check_session(self.id)?;
    let mut table = self.store.inner.table.lock();
    let release = match table.holders.get_mut(&key) {
      Some((holder, count)) if *holder == self.id => {
        *count -= 1;
        *count == 0
      }
      _ => return Ok(false),
    };
    if release {
      table.holders.remove(&key);
    }
    Ok(true)
  }
}

impl Drop for MemorySession {
  // Ending a session releases everything it held.
  fn drop(&mut self) {
    let mut table = self.store.inner.table.lock();
    let before = table.holders.len();
    table.holders.retain(|_, (holder, _)| *holder != self.id);
    trace!(
      session_id = self.id,
      released = before - table.holders.len(),
      "Closed memory lock session."
    );
  }
}
