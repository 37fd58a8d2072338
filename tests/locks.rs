//! tests/locks.rs
//! Distributed lock semantics across lock managers sharing one store.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::common::{lock_manager, setup_tracing};
use lockstep::{
  async_trait, lock_key, DoneReason, JobContext, LockError, LockKey, LockManager, LockSession,
  LockStore, MemoryLockStore,
};

#[tokio::test]
async fn test_mutual_exclusion_across_managers() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let replica_a = lock_manager(&store);
  let replica_b = lock_manager(&store);

  assert!(replica_a.acquire_lock("sync").await.unwrap());
  assert!(!replica_b.acquire_lock("sync").await.unwrap());
  assert!(replica_b.is_locked("sync").await.unwrap());
  assert!(replica_a.is_locked("sync").await.unwrap());

  // A different name is independent.
  assert!(replica_b.acquire_lock("cleanup").await.unwrap());
}

#[tokio::test]
async fn test_release_then_reacquire_elsewhere() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let replica_a = lock_manager(&store);
  let replica_b = lock_manager(&store);

  assert!(replica_a.acquire_lock("sync").await.unwrap());
  replica_a.release_lock("sync").await.unwrap();
  assert!(replica_b.acquire_lock("sync").await.unwrap());
  assert!(!replica_a.acquire_lock("sync").await.unwrap());
}

#[tokio::test]
async fn test_is_locked_leaves_lock_free() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let locks = lock_manager(&store);

  assert!(!locks.is_locked("sync").await.unwrap());
  assert_eq!(store.held_count(), 0);
  assert!(locks.held_locks().await.is_empty());
}

#[test]
fn test_key_derivation_is_stable() {
  let names = ["sync", "sync_prices", "refresh_views", "cleanup_sessions"];
  let first: Vec<i64> = names.iter().map(|n| lock_key(n)).collect();
  let second: Vec<i64> = names.iter().map(|n| lock_key(n)).collect();
  assert_eq!(first, second);
  assert!(first.iter().all(|k| *k >= 0));
  assert_eq!(first.iter().collect::<HashSet<_>>().len(), names.len());
}

#[tokio::test(start_paused = true)]
async fn test_timed_acquire_waits_at_least_timeout() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let holder = lock_manager(&store);
  let waiter = Arc::new(LockManager::new(Arc::new(store.clone())));
  assert!(holder.acquire_lock("sync").await.unwrap());

  let started = tokio::time::Instant::now();
  let err = waiter
    .acquire_lock_with_timeout("sync", StdDuration::from_millis(500), &JobContext::background())
    .await
    .unwrap_err();
  assert!(matches!(err, LockError::Timeout { .. }));
  assert!(started.elapsed() >= StdDuration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn test_timed_acquire_succeeds_after_release() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let holder = lock_manager(&store);
  let waiter = lock_manager(&store);
  assert!(holder.acquire_lock("sync").await.unwrap());

  let release = {
    let holder = holder.clone();
    tokio::spawn(async move {
      tokio::time::sleep(StdDuration::from_millis(200)).await;
      holder.release_lock("sync").await.unwrap();
    })
  };

  let acquired = waiter
    .acquire_lock_with_timeout("sync", StdDuration::from_secs(5), &JobContext::background())
    .await
    .unwrap();
  assert!(acquired);
  release.await.unwrap();
  assert_eq!(waiter.held_locks().await, vec!["sync".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_lock_wait() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let holder = lock_manager(&store);
  let waiter = lock_manager(&store);
  assert!(holder.acquire_lock("sync").await.unwrap());

  let ctx = JobContext::background();
  let canceller = {
    let ctx = ctx.clone();
    tokio::spawn(async move {
      tokio::time::sleep(StdDuration::from_millis(100)).await;
      ctx.cancel();
    })
  };

  let started = tokio::time::Instant::now();
  let err = waiter
    .acquire_lock_with_timeout("sync", StdDuration::from_secs(30), &ctx)
    .await
    .unwrap_err();
  assert!(matches!(err, LockError::Cancelled(DoneReason::Cancelled)));
  assert!(started.elapsed() < StdDuration::from_secs(1));
  canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deadline_aborts_lock_wait() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let holder = lock_manager(&store);
  let waiter = lock_manager(&store);
  assert!(holder.acquire_lock("sync").await.unwrap());

  let ctx = JobContext::background().for_firing("sync", Some(StdDuration::from_millis(100)));
  let err = waiter
    .acquire_lock_with_timeout("sync", StdDuration::from_secs(30), &ctx)
    .await
    .unwrap_err();
  assert!(matches!(err, LockError::Cancelled(DoneReason::DeadlineExceeded)));
  assert_eq!(err.to_string(), "lock wait interrupted: deadline exceeded");
}

#[tokio::test]
async fn test_store_outage_is_an_error_not_contention() {
  setup_tracing();
  let store = MemoryLockStore::new();
  let locks = lock_manager(&store);

  assert!(locks.acquire_lock("held").await.unwrap());
  store.set_unavailable(true);
  assert!(locks.acquire_lock("sync").await.unwrap_err().is_store());
  assert!(locks.is_locked("sync").await.unwrap_err().is_store());

  // The session survived, and so did the lock it held.
  assert_eq!(locks.held_locks().await, vec!["held".to_string()]);
  assert!(store.is_held(lock_key("held")));

  store.set_unavailable(false);
  assert!(locks.acquire_lock("sync").await.unwrap());
  assert!(!lock_manager(&store).acquire_lock("held").await.unwrap());
}

// --- Hung store ---

/// A store whose sessions never answer `try_lock`.
#[derive(Default)]
struct HangingStore {
  opened: Arc<AtomicUsize>,
}

struct HangingSession;

#[async_trait]
impl LockStore for HangingStore {
  async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
    self.opened.fetch_add(1, Ordering::SeqCst);
    Ok(Box::new(HangingSession))
  }
}

#[async_trait]
impl LockSession for HangingSession {
  async fn try_lock(&mut self, _key: LockKey) -> Result<bool, LockError> {
    std::future::pending().await
  }

  async fn unlock(&mut self, _key: LockKey) -> Result<bool, LockError> {
    Ok(true)
  }
}

fn hanging_manager() -> (Arc<LockManager>, Arc<AtomicUsize>) {
  let store = HangingStore::default();
  let opened = store.opened.clone();
  let locks = LockManager::new(Arc::new(store)).with_poll_interval(StdDuration::from_millis(10));
  (Arc::new(locks), opened)
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_call_honors_wait_timeout() {
  setup_tracing();
  let (locks, opened) = hanging_manager();
  let ctx = JobContext::background().for_firing("sync", Some(StdDuration::from_millis(200)));

  let started = tokio::time::Instant::now();
  let result = tokio::time::timeout(
    StdDuration::from_secs(3),
    locks.acquire_lock_with_timeout("sync", StdDuration::from_millis(100), &ctx),
  )
  .await
  .expect("lock wait must not outlive its timeout");
  assert!(matches!(result, Err(LockError::Timeout { .. })));
  assert!(started.elapsed() < StdDuration::from_millis(200));

  // The abandoned call took its session with it; the next wait opens a new one.
  assert!(locks.held_locks().await.is_empty());
  assert_eq!(opened.load(Ordering::SeqCst), 1);
  let result = locks
    .acquire_lock_with_timeout("sync", StdDuration::from_millis(50), &JobContext::background())
    .await;
  assert!(matches!(result, Err(LockError::Timeout { .. })));
  assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_call_honors_cancellation() {
  setup_tracing();
  let (locks, _) = hanging_manager();
  let ctx = JobContext::background();
  let canceller = {
    let ctx = ctx.clone();
    tokio::spawn(async move {
      tokio::time::sleep(StdDuration::from_millis(50)).await;
      ctx.cancel();
    })
  };

  let result = tokio::time::timeout(
    StdDuration::from_secs(3),
    locks.acquire_lock_with_timeout("sync", StdDuration::from_secs(30), &ctx),
  )
  .await
  .expect("cancellation must end the lock wait");
  assert!(matches!(result, Err(LockError::Cancelled(DoneReason::Cancelled))));
  canceller.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_hung_store_call_times_out() {
  setup_tracing();
  let store = HangingStore::default();
  let opened = store.opened.clone();
  let locks = LockManager::new(Arc::new(store)).with_call_timeout(StdDuration::from_millis(100));

  let err = locks.acquire_lock("sync").await.unwrap_err();
  assert!(err.is_session_lost());
  assert!(locks.held_locks().await.is_empty());

  let err = locks.acquire_lock("sync").await.unwrap_err();
  assert!(err.is_session_lost());
  assert_eq!(opened.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_not_held_behind_hung_call() {
  setup_tracing();
  let (locks, _) = hanging_manager();
  let stuck = {
    let locks = locks.clone();
    tokio::spawn(async move { locks.acquire_lock("sync").await })
  };
  // Let the stuck call take the session.
  tokio::time::sleep(StdDuration::from_millis(1)).await;

  let ctx = JobContext::background();
  let started = tokio::time::Instant::now();
  let err = locks
    .acquire_lock_with_timeout("cleanup", StdDuration::from_millis(100), &ctx)
    .await
    .unwrap_err();
  assert!(matches!(err, LockError::Timeout { .. }));
  assert!(started.elapsed() < StdDuration::from_millis(200));
  stuck.abort();
}
