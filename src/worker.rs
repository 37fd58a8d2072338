use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn, Instrument};

use crate::command::FiringOrigin;
use crate::error::{ErrorKind, JobError};
use crate::job::{panic_message, Job, JobContext};
use crate::metrics::ManagerMetrics;

#[cfg(feature = "job_context")]
use crate::job::context::CURRENT_JOB_CONTEXT;

/// Runs one firing of `job` in `ctx`, recording metrics and logging the outcome.
///
/// The job body runs on its own task so that a panic is contained and reported
/// as an `ErrorKind::Panicked` failure. The result is returned for manual
/// triggers; the trigger engine drops it, having logged it here.
pub(crate) async fn run_firing(
  job: Arc<dyn Job>,
  origin: FiringOrigin,
  ctx: JobContext,
  metrics: ManagerMetrics,
) -> Result<(), JobError> {
  let span = tracing::span!(
    tracing::Level::INFO,
    "job_firing",
    job = job.name(),
    firing_id = %ctx.firing_id,
    origin = %origin,
  );
  execute_and_record(job, ctx, metrics).instrument(span).await
}

async fn execute_and_record(
  job: Arc<dyn Job>,
  ctx: JobContext,
  metrics: ManagerMetrics,
) -> Result<(), JobError> {
  ManagerMetrics::incr(&metrics.firings_started);
  metrics
    .firings_active_current
    .fetch_add(1, AtomicOrdering::Relaxed);
  info!("Starting job firing.");
  let started = Instant::now();

  let result = execute_job_logic(job, ctx).await;

  let duration = started.elapsed();
  metrics.firing_duration.record(duration);
  metrics
    .firings_active_current
    .fetch_sub(1, AtomicOrdering::Relaxed);

  match &result {
    Ok(()) => {
      ManagerMetrics::incr(&metrics.firings_succeeded);
      info!(duration_ms = duration.as_millis() as u64, "Job firing succeeded.");
    }
    Err(e) => {
      ManagerMetrics::incr(&metrics.firings_failed);
      if e.kind() == ErrorKind::Panicked {
        ManagerMetrics::incr(&metrics.firings_panicked);
      }
      if e.is_cancellation() {
        warn!(duration_ms = duration.as_millis() as u64, error = %e, "Job firing cancelled.");
      } else {
        error!(
          duration_ms = duration.as_millis() as u64,
          kind = %e.kind(),
          error = %e,
          "Job firing failed."
        );
      }
    }
  }
  result
}

async fn execute_job_logic(job: Arc<dyn Job>, ctx: JobContext) -> Result<(), JobError> {
  #[cfg(feature = "job_context")]
  let task = {
    let scoped = ctx.clone();
    tokio::spawn(
      CURRENT_JOB_CONTEXT.scope(scoped, async move { job.execute(&ctx).await })
        .in_current_span(),
    )
  };
  #[cfg(not(feature = "job_context"))]
  let task = tokio::spawn(async move { job.execute(&ctx).await }.in_current_span());

  match task.await {
    Ok(result) => result,
    Err(join_error) if join_error.is_panic() => {
      let message = panic_message(join_error.into_panic().as_ref());
      error!(panic = %message, "Job panicked.");
      Err(JobError::panicked(format!("job panicked: {}", message)))
    }
    Err(_) => {
      warn!("Job task was aborted during execution.");
      Err(JobError::cancelled())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{BoxedExecFn, FnJob};

  fn job(exec: BoxedExecFn) -> Arc<dyn Job> {
    Arc::new(FnJob::new("unit", "@every 1h", exec))
  }

  #[tokio::test]
  async fn panic_is_reported_as_failure() {
    let metrics = ManagerMetrics::new();
    let panicking = job(Box::new(|_ctx| {
      Box::pin(async {
        if true {
          panic!("boom");
        }
        Ok(())
      })
    }));
    let err = run_firing(
      panicking,
      FiringOrigin::Manual,
      JobContext::background(),
      metrics.clone(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Panicked);
    assert!(err.message().contains("boom"));

    let snap = metrics.snapshot();
    assert_eq!(snap.firings_started, 1);
    assert_eq!(snap.firings_failed, 1);
    assert_eq!(snap.firings_panicked, 1);
    assert_eq!(snap.firings_active_current, 0);
  }

  #[cfg(feature = "job_context")]
  #[tokio::test]
  async fn firing_context_is_task_local() {
    let ctx = JobContext::background().for_firing("unit", None);
    let expected = ctx.firing_id;
    let observer = job(Box::new(move |_ctx| {
      Box::pin(async move {
        match crate::job::context::try_get_current_job_context() {
          Some(current) if current.firing_id == expected => Ok(()),
          Some(_) => Err(JobError::permanent("wrong firing id")),
          None => Err(JobError::permanent("no task-local context")),
        }
      })
    }));
    run_firing(observer, FiringOrigin::Manual, ctx, ManagerMetrics::new())
      .await
      .unwrap();
  }
}
