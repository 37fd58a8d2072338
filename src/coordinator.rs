use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::command::{FiringOrigin, ShutdownMode};
use crate::job::{Job, JobContext};
use crate::metrics::ManagerMetrics;
use crate::schedule::Schedule;
use crate::worker::run_firing;

/// One job as the trigger engine sees it.
#[derive(Clone)]
pub(crate) struct ScheduledEntry {
  pub job: Arc<dyn Job>,
  pub schedule: Schedule,
}

/// The trigger engine: sleeps until the earliest next firing, spawns every
/// firing that is due onto the tracker, and computes each job's following
/// firing time.
///
/// Missed ticks are not replayed. After a late wakeup the next firing is
/// computed from the current time.
pub(crate) struct Coordinator {
  entries: Vec<ScheduledEntry>,
  queue: BinaryHeap<(Reverse<DateTime<Utc>>, usize)>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  root: JobContext,
  tracker: TaskTracker,
  firing_timeout: Duration,
  metrics: ManagerMetrics,
}

impl Coordinator {
  pub fn new(
    entries: Vec<ScheduledEntry>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    root: JobContext,
    tracker: TaskTracker,
    firing_timeout: Duration,
    metrics: ManagerMetrics,
  ) -> Self {
    Self {
      entries,
      queue: BinaryHeap::new(),
      shutdown_rx,
      root,
      tracker,
      firing_timeout,
      metrics,
    }
  }

  /// Runs the main event loop until shutdown is signalled.
  pub async fn run(mut self) {
    let now = Utc::now();
    for index in 0..self.entries.len() {
      self.push_next(index, now);
    }
    info!(jobs = self.entries.len(), "Trigger engine started.");

    loop {
      if let Some(mode) = *self.shutdown_rx.borrow() {
        info!(?mode, "Trigger engine received shutdown signal.");
        break;
      }

      let sleep_duration = self.calculate_sleep();

      tokio::select! {
        biased;

        changed = self.shutdown_rx.changed() => {
          if changed.is_err() {
            warn!("Shutdown channel closed; trigger engine exiting.");
            break;
          }
          // Loop head inspects the new value.
        }

        _ = sleep(sleep_duration.unwrap_or(Duration::ZERO)), if sleep_duration.is_some() => {
          self.fire_due();
        }
      }
    }

    info!("Trigger engine stopped.");
  }

  /// Time until the earliest queued firing; `None` when nothing is queued.
  fn calculate_sleep(&self) -> Option<Duration> {
    self.queue.peek().map(|(Reverse(next_run), _)| {
      next_run
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
    })
  }

  fn fire_due(&mut self) {
    let now = Utc::now();
    while let Some(&(Reverse(next_run), index)) = self.queue.peek() {
      if next_run > now {
        break;
      }
      self.queue.pop();

      let entry = &self.entries[index];
      let lateness_ms = now.signed_duration_since(next_run).num_milliseconds();
      debug!(job = entry.job.name(), scheduled = %next_run, lateness_ms, "Job is due.");

      let ctx = self
        .root
        .for_firing(entry.job.name(), Some(self.firing_timeout));
      self.tracker.spawn(run_firing(
        entry.job.clone(),
        FiringOrigin::Scheduled,
        ctx,
        self.metrics.clone(),
      ));

      self.push_next(index, now);
    }
  }

  fn push_next(&mut self, index: usize, after: DateTime<Utc>) {
    let entry = &self.entries[index];
    match entry.schedule.next_after(after) {
      Some(next_run) => {
        trace!(job = entry.job.name(), next_run = %next_run, "Queued next firing.");
        self.queue.push((Reverse(next_run), index));
      }
      None => {
        warn!(
          job = entry.job.name(),
          schedule = %entry.schedule,
          "Schedule has no future firings; job will not run again."
        );
      }
    }
  }
}
