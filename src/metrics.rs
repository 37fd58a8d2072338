use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// In-memory counters for one manager. Nothing here is persisted.
///
/// Cloning only clones the `Arc`s, so the manager, the trigger engine, firing
/// tasks and retry decorators all update the same values.
#[derive(Debug, Clone, Default)]
pub struct ManagerMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Firings started (scheduled, startup and manual).
  pub firings_started: Arc<AtomicUsize>,
  pub firings_succeeded: Arc<AtomicUsize>,
  /// Firings that returned an error (including panics).
  pub firings_failed: Arc<AtomicUsize>,
  pub firings_panicked: Arc<AtomicUsize>,
  /// Executions skipped because the job lock was held elsewhere.
  pub skipped_locked: Arc<AtomicUsize>,
  /// Lock store failures seen while acquiring or releasing job locks.
  pub lock_errors: Arc<AtomicUsize>,
  /// Attempts made after the first one.
  pub retries_attempted: Arc<AtomicUsize>,
  /// Retry loops that ran out of attempts.
  pub retries_exhausted: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  pub firings_active_current: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  /// Wall time of each firing.
  pub firing_duration: Arc<SimpleHistogram>,
}

impl ManagerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      firings_started: self.firings_started.load(order),
      firings_succeeded: self.firings_succeeded.load(order),
      firings_failed: self.firings_failed.load(order),
      firings_panicked: self.firings_panicked.load(order),
      skipped_locked: self.skipped_locked.load(order),
      lock_errors: self.lock_errors.load(order),
      retries_attempted: self.retries_attempted.load(order),
      retries_exhausted: self.retries_exhausted.load(order),
      firings_active_current: self.firings_active_current.load(order),
      firing_duration_count: self.firing_duration.get_count(),
      firing_duration_sum_micros: self.firing_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of a manager's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub firings_started: usize,
  pub firings_succeeded: usize,
  pub firings_failed: usize,
  pub firings_panicked: usize,
  pub skipped_locked: usize,
  pub lock_errors: usize,
  pub retries_attempted: usize,
  pub retries_exhausted: usize,
  // Gauges
  pub firings_active_current: usize,
  // Histogram Data
  pub firing_duration_count: usize,
  pub firing_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean firing duration, `None` until a firing has completed.
  pub fn mean_firing_duration(&self) -> Option<Duration> {
    if self.firing_duration_count == 0 {
      None
    } else {
      Some(Duration::from_micros(
        (self.firing_duration_sum_micros / self.firing_duration_count) as u64,
      ))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_reads_shared_counters() {
    let metrics = ManagerMetrics::new();
    let clone = metrics.clone();
    ManagerMetrics::incr(&clone.firings_started);
    ManagerMetrics::incr(&clone.firings_started);
    clone.firing_duration.record(Duration::from_millis(10));
    clone.firing_duration.record(Duration::from_millis(30));

    let snap = metrics.snapshot();
    assert_eq!(snap.firings_started, 2);
    assert_eq!(snap.firing_duration_count, 2);
    assert_eq!(snap.mean_firing_duration(), Some(Duration::from_millis(20)));
    assert_eq!(MetricsSnapshot::default().mean_firing_duration(), None);
  }
}
