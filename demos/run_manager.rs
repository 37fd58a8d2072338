//! demos/run_manager.rs
//!
//! Runs a small job set against PostgreSQL advisory locks.
//!
//! - `serve`: start the manager and run until Ctrl-C, then shut down gracefully.
//! - `once <job>`: run one job's body a single time, bypassing locks.
//! - `status`: print live lock status and next firing times.
//!
//! Configuration comes from the environment (`DATABASE_URL`,
//! `LOCKSTEP_FIRING_TIMEOUT_SECS`, `LOCKSTEP_STARTUP_JOBS`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use clap::{Parser, Subcommand};
use lockstep::{
  async_trait, Job, JobContext, JobError, JobManager, JobPolicy, ManagerConfig,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "run_manager", about = "Lockstep job manager demo")]
struct Cli {
  /// Seconds to wait for in-flight firings on shutdown.
  #[arg(long, default_value_t = 30)]
  shutdown_timeout: u64,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Start the manager and run until Ctrl-C.
  Serve,
  /// Run one registered job once and exit.
  Once { job: String },
  /// Print lock status and next firing times.
  Status,
}

/// Pretends to pull prices from an upstream; fails transiently now and then.
struct SyncPrices {
  runs: AtomicUsize,
}

#[async_trait]
impl Job for SyncPrices {
  fn name(&self) -> &str {
    "sync_prices"
  }

  fn schedule(&self) -> &str {
    "*/5 * * * *"
  }

  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
    let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
    info!(run, "Fetching prices...");
    ctx.sleep(StdDuration::from_secs(2)).await?;
    if run % 3 == 0 {
      return Err(JobError::transient("upstream returned 503"));
    }
    info!(run, "Prices stored.");
    Ok(())
  }
}

struct RefreshViews;

#[async_trait]
impl Job for RefreshViews {
  fn name(&self) -> &str {
    "refresh_views"
  }

  fn schedule(&self) -> &str {
    "@every 1m"
  }

  fn run_on_startup(&self) -> bool {
    true
  }

  async fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
    for view in ["daily_totals", "top_products"] {
      ctx.check()?;
      info!(view, "Refreshing materialized view.");
      ctx.sleep(StdDuration::from_millis(500)).await?;
    }
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,lockstep=info,run_manager=info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let cli = Cli::parse();
  let config = ManagerConfig::from_env()?;

  // --- Build Manager ---
  let manager = JobManager::builder().from_config(&config).build()?;
  manager.register_job_with_config(
    Arc::new(SyncPrices {
      runs: AtomicUsize::new(0),
    }),
    JobPolicy::default()
      .with_lock_timeout(StdDuration::from_secs(5))
      .with_retries(3),
  )?;
  manager.register_job(Arc::new(RefreshViews))?;

  match cli.command {
    Command::Serve => {
      manager.start()?;
      info!("Manager running; press Ctrl-C to stop.");
      tokio::signal::ctrl_c().await?;

      info!("Shutting down...");
      match manager
        .stop_with_timeout(StdDuration::from_secs(cli.shutdown_timeout))
        .await
      {
        Ok(()) => info!("All firings finished."),
        Err(e) => error!(error = %e, "Shutdown did not complete cleanly."),
      }
      let metrics = manager.metrics_snapshot();
      info!(
        started = metrics.firings_started,
        succeeded = metrics.firings_succeeded,
        failed = metrics.firings_failed,
        skipped = metrics.skipped_locked,
        "Final metrics."
      );
    }
    Command::Once { job } => {
      let ctx = JobContext::background();
      manager.run_job_once(&job, &ctx).await?;
      info!(job = %job, "Job finished.");
    }
    Command::Status => {
      let ctx = JobContext::background();
      for (name, status) in manager.get_job_status(&ctx).await? {
        println!("{:<16} {:<14} locked={}", name, status.schedule, status.locked);
      }
      for (name, next) in manager.next_run_times() {
        match next {
          Some(at) => println!("{:<16} next at {}", name, at),
          None => println!("{:<16} no further firings", name),
        }
      }
    }
  }

  Ok(())
}
