use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};

use crate::command::{FiringOrigin, ShutdownMode};
use crate::config::{ManagerConfig, DEFAULT_FIRING_TIMEOUT};
use crate::coordinator::{Coordinator, ScheduledEntry};
use crate::error::{
  BuildError, JobError, LockError, QueryError, RegisterError, ShutdownError, StartError,
  TriggerError,
};
use crate::job::{panic_message, Job, JobContext, JobStatus};
use crate::lock::{LockManager, LockStore};
use crate::metrics::{ManagerMetrics, MetricsSnapshot};
use crate::retry::{JobPolicy, RetryingJob};
use crate::schedule::Schedule;

#[cfg(feature = "job_context")]
use crate::job::context::CURRENT_JOB_CONTEXT;

// --- Builder ---

/// Builder for configuring and creating a [`JobManager`].
///
/// A lock backend is required: either a [`LockStore`], a ready
/// [`LockManager`], or (with the `postgres` feature) a database URL taken from
/// a [`ManagerConfig`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use lockstep::{JobManager, MemoryLockStore};
///
/// # fn run() -> Result<(), lockstep::BuildError> {
/// let manager = JobManager::builder()
///     .lock_store(Arc::new(MemoryLockStore::new()))
///     .startup_job("sync_prices")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ManagerBuilder {
  lock_store: Option<Arc<dyn LockStore>>,
  lock_manager: Option<Arc<LockManager>>,
  database_url: Option<String>,
  default_policy: JobPolicy,
  firing_timeout: Duration,
  startup_jobs: HashSet<String>,
}

impl Default for ManagerBuilder {
  fn default() -> Self {
    Self {
      lock_store: None,
      lock_manager: None,
      database_url: None,
      default_policy: JobPolicy::default(),
      firing_timeout: DEFAULT_FIRING_TIMEOUT,
      startup_jobs: HashSet::new(),
    }
  }
}

impl ManagerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Backing store for a new, dedicated [`LockManager`].
  pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
    self.lock_store = Some(store);
    self
  }

  /// Shares an existing lock manager (and its pinned session). Takes
  /// precedence over [`Self::lock_store`].
  pub fn lock_manager(mut self, locks: Arc<LockManager>) -> Self {
    self.lock_manager = Some(locks);
    self
  }

  /// Policy used by [`JobManager::register_job`].
  pub fn default_policy(mut self, policy: JobPolicy) -> Self {
    self.default_policy = policy;
    self
  }

  /// Deadline applied to every firing (default 30 minutes).
  pub fn firing_timeout(mut self, timeout: Duration) -> Self {
    self.firing_timeout = timeout;
    self
  }

  /// Adds a job name to the run-at-start allow-list.
  pub fn startup_job(mut self, name: impl Into<String>) -> Self {
    self.startup_jobs.insert(name.into());
    self
  }

  pub fn startup_jobs<I, S>(mut self, names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.startup_jobs.extend(names.into_iter().map(Into::into));
    self
  }

  /// Applies every setting from `config`. The database URL is only used when
  /// no lock store or lock manager is supplied.
  pub fn from_config(self, config: &ManagerConfig) -> Self {
    let mut builder = self
      .default_policy(config.default_policy.clone())
      .firing_timeout(config.firing_timeout)
      .startup_jobs(config.startup_jobs.iter().cloned());
    builder.database_url = Some(config.database_url.clone());
    builder
  }

  pub fn build(mut self) -> Result<JobManager, BuildError> {
    let locks = match (self.lock_manager.take(), self.lock_store.take()) {
      (Some(locks), _) => locks,
      (None, Some(store)) => Arc::new(LockManager::new(store)),
      (None, None) => Arc::new(LockManager::new(Self::store_from_url(
        self.database_url.take(),
      )?)),
    };
    Ok(self.into_manager(locks))
  }

  fn into_manager(self, locks: Arc<LockManager>) -> JobManager {
    let (shutdown_tx, _shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    JobManager {
      registry: RwLock::new(Vec::new()),
      locks,
      default_policy: self.default_policy,
      firing_timeout: self.firing_timeout,
      startup_jobs: self.startup_jobs,
      metrics: ManagerMetrics::new(),
      root: JobContext::background(),
      tracker: TaskTracker::new(),
      shutdown_tx,
      lifecycle: Mutex::new(Lifecycle::Idle),
    }
  }

  #[cfg(feature = "postgres")]
  fn store_from_url(url: Option<String>) -> Result<Arc<dyn LockStore>, BuildError> {
    let url = url.ok_or(BuildError::MissingLockStore)?;
    Ok(Arc::new(crate::lock::PgLockStore::new(&url)?))
  }

  #[cfg(not(feature = "postgres"))]
  fn store_from_url(_url: Option<String>) -> Result<Arc<dyn LockStore>, BuildError> {
    Err(BuildError::MissingLockStore)
  }
}

// --- Manager ---

#[derive(Clone)]
struct RegisteredJob {
  /// The job as registered by the caller.
  raw: Arc<dyn Job>,
  /// What the engine runs: `raw` or its `RetryingJob` wrapper.
  scheduled: Arc<dyn Job>,
  schedule: Schedule,
}

enum Lifecycle {
  Idle,
  Running { coordinator: JoinHandle<()> },
  Stopped,
}

/// Registry, trigger engine and lifecycle for a set of scheduled jobs.
///
/// Lifecycle is `build -> register_* -> start -> stop`. Jobs can only be
/// registered before `start`; a stopped manager cannot be restarted.
pub struct JobManager {
  registry: RwLock<Vec<RegisteredJob>>,
  locks: Arc<LockManager>,
  default_policy: JobPolicy,
  firing_timeout: Duration,
  startup_jobs: HashSet<String>,
  metrics: ManagerMetrics,
  // Parent of every firing context; cancelled on forced shutdown.
  root: JobContext,
  tracker: TaskTracker,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  lifecycle: Mutex<Lifecycle>,
}

impl JobManager {
  pub fn builder() -> ManagerBuilder {
    ManagerBuilder::new()
  }

  /// Shorthand for a manager over `locks` with default settings.
  pub fn new(locks: Arc<LockManager>) -> Self {
    ManagerBuilder::new().into_manager(locks)
  }

  // --- Registration ---

  /// Registers `job` wrapped in a [`RetryingJob`] with the default policy.
  ///
  /// A job that is already a `RetryingJob` is registered as is.
  pub fn register_job(&self, job: Arc<dyn Job>) -> Result<(), RegisterError> {
    self.register(job, Some(self.default_policy.clone()))
  }

  /// Registers `job` wrapped in a [`RetryingJob`] with `policy`.
  pub fn register_job_with_config(
    &self,
    job: Arc<dyn Job>,
    policy: JobPolicy,
  ) -> Result<(), RegisterError> {
    self.register(job, Some(policy))
  }

  /// Registers `job` without a lock or retries. Concurrent firings across
  /// processes are not prevented.
  pub fn register_job_without_locking(&self, job: Arc<dyn Job>) -> Result<(), RegisterError> {
    self.register(job, None)
  }

  fn register(&self, job: Arc<dyn Job>, policy: Option<JobPolicy>) -> Result<(), RegisterError> {
    let name = job.name().to_string();
    if name.trim().is_empty() {
      return Err(RegisterError::EmptyName);
    }
    let schedule = Schedule::parse(job.schedule()).map_err(|source| {
      error!(job = %name, schedule = job.schedule(), error = %source, "Rejected job with invalid schedule.");
      RegisterError::InvalidSchedule {
        name: name.clone(),
        source,
      }
    })?;

    let lifecycle = self.lifecycle.lock();
    if !matches!(*lifecycle, Lifecycle::Idle) {
      return Err(RegisterError::AlreadyStarted);
    }
    let mut registry = self.registry.write();
    if registry.iter().any(|entry| entry.raw.name() == name) {
      return Err(RegisterError::DuplicateName(name));
    }

    let scheduled: Arc<dyn Job> = match policy {
      Some(policy) if !job.is_retrying() => Arc::new(
        RetryingJob::new(job.clone(), self.locks.clone(), policy).with_metrics(self.metrics.clone()),
      ),
      _ => job.clone(),
    };
    info!(
      job = %name,
      schedule = %schedule,
      locked = scheduled.is_retrying(),
      "Registered job."
    );
    registry.push(RegisteredJob {
      raw: job,
      scheduled,
      schedule,
    });
    Ok(())
  }

  // --- Lifecycle ---

  /// Launches startup jobs, then the trigger engine. Returns immediately;
  /// startup jobs run concurrently and are not awaited.
  pub fn start(&self) -> Result<(), StartError> {
    let handle = Handle::try_current().map_err(|_| StartError::NoRuntime)?;
    let mut lifecycle = self.lifecycle.lock();
    if !matches!(*lifecycle, Lifecycle::Idle) {
      return Err(StartError::AlreadyStarted);
    }

    let registry = self.registry.read().clone();
    for entry in &registry {
      let name = entry.raw.name();
      if self.startup_jobs.contains(name) || entry.raw.run_on_startup() {
        info!(job = name, "Launching startup run.");
        self.spawn_firing(entry.scheduled.clone(), FiringOrigin::Startup);
      }
    }
    for name in &self.startup_jobs {
      if !registry.iter().any(|entry| entry.raw.name() == name) {
        warn!(job = %name, "Startup job is not registered.");
      }
    }

    let entries = registry
      .iter()
      .map(|entry| ScheduledEntry {
        job: entry.scheduled.clone(),
        schedule: entry.schedule.clone(),
      })
      .collect();
    let coordinator = Coordinator::new(
      entries,
      self.shutdown_tx.subscribe(),
      self.root.clone(),
      self.tracker.clone(),
      self.firing_timeout,
      self.metrics.clone(),
    );
    let coordinator = handle.spawn(coordinator.run().in_current_span());
    *lifecycle = Lifecycle::Running { coordinator };
    info!(jobs = registry.len(), "Job manager started.");
    Ok(())
  }

  /// Stops scheduling new firings and waits for every in-flight firing
  /// (scheduled, startup or manual) to finish.
  ///
  /// Safe to call more than once; a never-started manager stops at once.
  pub async fn stop(&self) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Graceful, None).await
  }

  /// Like [`Self::stop`], but gives up after `timeout`: every in-flight
  /// firing's context is cancelled and `ShutdownError::Timeout` is returned.
  pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Graceful, Some(timeout)).await
  }

  /// Cancels every in-flight firing's context, then waits for them to return.
  pub async fn stop_force(&self) -> Result<(), ShutdownError> {
    self.shutdown(ShutdownMode::Force, None).await
  }

  async fn shutdown(
    &self,
    mode: ShutdownMode,
    timeout: Option<Duration>,
  ) -> Result<(), ShutdownError> {
    let previous = {
      let mut lifecycle = self.lifecycle.lock();
      std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
    };
    let coordinator = match previous {
      Lifecycle::Running { coordinator } => Some(coordinator),
      Lifecycle::Idle | Lifecycle::Stopped => None,
    };
    info!(?mode, in_flight = self.tracker.len(), "Stopping job manager.");

    self.shutdown_tx.send_replace(Some(mode));
    if mode == ShutdownMode::Force {
      self.root.cancel();
    }
    self.tracker.close();

    let mut result = Ok(());
    if let Some(coordinator) = coordinator {
      if let Err(e) = coordinator.await {
        error!(error = %e, "Trigger engine task panicked.");
        result = Err(ShutdownError::TaskPanic);
      }
    }

    match timeout {
      None => self.tracker.wait().await,
      Some(timeout) => {
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
          warn!(
            timeout_ms = timeout.as_millis() as u64,
            in_flight = self.tracker.len(),
            "Shutdown timed out; cancelling in-flight firings."
          );
          self.shutdown_tx.send_replace(Some(ShutdownMode::Force));
          self.root.cancel();
          return Err(ShutdownError::Timeout);
        }
      }
    }

    if result.is_ok() {
      info!("Job manager stopped.");
    }
    result
  }

  pub fn is_running(&self) -> bool {
    matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
  }

  // --- Manual runs ---

  /// Fires `name` now through the same path as a scheduled firing (lock
  /// policy, retries, firing deadline, metrics) and returns its result.
  pub async fn trigger_job_now(&self, name: &str) -> Result<(), TriggerError> {
    let job = self
      .find(name)
      .map(|entry| entry.scheduled)
      .ok_or_else(|| TriggerError::JobNotFound(name.to_string()))?;

    match self.spawn_firing(job, FiringOrigin::Manual).await {
      Ok(Ok(())) => Ok(()),
      Ok(Err(source)) => Err(TriggerError::Job {
        name: name.to_string(),
        source,
      }),
      Err(e) => {
        error!(job = name, error = %e, "Manual firing task failed.");
        Err(TriggerError::TaskPanic(name.to_string()))
      }
    }
  }

  /// Runs the registered job's own `execute` exactly once in a child of
  /// `ctx`, bypassing scheduling, locking and retries.
  pub async fn run_job_once(&self, name: &str, ctx: &JobContext) -> Result<(), TriggerError> {
    let job = self
      .find(name)
      .map(|entry| entry.raw)
      .ok_or_else(|| TriggerError::JobNotFound(name.to_string()))?;
    let ctx = ctx.for_firing(name, None);
    let span = tracing::info_span!("job_run_once", job = name, firing_id = %ctx.firing_id);

    let run = async {
      info!("Running job once.");
      let result = match AssertUnwindSafe(job.execute(&ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(JobError::panicked(format!(
          "job panicked: {}",
          panic_message(payload.as_ref())
        ))),
      };
      match &result {
        Ok(()) => info!("Job run finished."),
        Err(e) => error!(error = %e, "Job run failed."),
      }
      result
    };

    #[cfg(feature = "job_context")]
    let result = CURRENT_JOB_CONTEXT
      .scope(ctx.clone(), run)
      .instrument(span)
      .await;
    #[cfg(not(feature = "job_context"))]
    let result = run.instrument(span).await;

    result.map_err(|source| TriggerError::Job {
      name: name.to_string(),
      source,
    })
  }

  fn spawn_firing(
    &self,
    job: Arc<dyn Job>,
    origin: FiringOrigin,
  ) -> JoinHandle<Result<(), JobError>> {
    let ctx = self.root.for_firing(job.name(), Some(self.firing_timeout));
    self.tracker.spawn(crate::worker::run_firing(
      job,
      origin,
      ctx,
      self.metrics.clone(),
    ))
  }

  // --- Introspection ---

  /// Defensive copy of the registered jobs, in registration order. Each entry
  /// is what the engine runs (the `RetryingJob` wrapper where one applies).
  pub fn get_jobs(&self) -> Vec<Arc<dyn Job>> {
    self
      .registry
      .read()
      .iter()
      .map(|entry| entry.scheduled.clone())
      .collect()
  }

  pub fn get_lock_manager(&self) -> Arc<LockManager> {
    self.locks.clone()
  }

  /// Whether the registered job `name` is locked anywhere right now.
  pub async fn is_job_locked(&self, ctx: &JobContext, name: &str) -> Result<bool, QueryError> {
    if self.find(name).is_none() {
      return Err(QueryError::JobNotFound(name.to_string()));
    }
    if let Some(reason) = ctx.done_reason() {
      return Err(LockError::Cancelled(reason).into());
    }
    Ok(self.locks.is_locked(name).await?)
  }

  /// Status of every registered job, keyed by name. Lock state is queried
  /// live; nothing is cached.
  pub async fn get_job_status(
    &self,
    ctx: &JobContext,
  ) -> Result<BTreeMap<String, JobStatus>, QueryError> {
    let registry = self.registry.read().clone();
    let mut statuses = BTreeMap::new();
    for entry in registry {
      if let Some(reason) = ctx.done_reason() {
        return Err(LockError::Cancelled(reason).into());
      }
      let name = entry.raw.name().to_string();
      let locked = self.locks.is_locked(&name).await?;
      statuses.insert(
        name.clone(),
        JobStatus {
          name,
          schedule: entry.schedule.to_string(),
          locked,
        },
      );
    }
    Ok(statuses)
  }

  /// Next firing time of every registered job, computed from now.
  pub fn next_run_times(&self) -> Vec<(String, Option<DateTime<Utc>>)> {
    let now = Utc::now();
    self
      .registry
      .read()
      .iter()
      .map(|entry| (entry.raw.name().to_string(), entry.schedule.next_after(now)))
      .collect()
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  fn find(&self, name: &str) -> Option<RegisteredJob> {
    self
      .registry
      .read()
      .iter()
      .find(|entry| entry.raw.name() == name)
      .cloned()
  }
}

impl Drop for JobManager {
  fn drop(&mut self) {
    if matches!(*self.lifecycle.get_mut(), Lifecycle::Running { .. }) {
      warn!("JobManager dropped while running; in-flight firings are cancelled.");
      self.shutdown_tx.send_replace(Some(ShutdownMode::Force));
      self.root.cancel();
    }
  }
}
