//! Environment-driven configuration for a [`JobManager`](crate::JobManager).

use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;
use crate::retry::JobPolicy;

/// Connection string of the lock store database (required).
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";
/// Per-firing deadline in whole seconds (optional).
pub const FIRING_TIMEOUT_VAR: &str = "LOCKSTEP_FIRING_TIMEOUT_SECS";
/// Comma-separated names of jobs to run once at start (optional).
pub const STARTUP_JOBS_VAR: &str = "LOCKSTEP_STARTUP_JOBS";

/// Ceiling on a single firing so a stuck job cannot run forever.
pub const DEFAULT_FIRING_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
  pub database_url: String,
  pub firing_timeout: Duration,
  pub startup_jobs: Vec<String>,
  pub default_policy: JobPolicy,
}

impl ManagerConfig {
  pub fn new(database_url: impl Into<String>) -> Self {
    Self {
      database_url: database_url.into(),
      firing_timeout: DEFAULT_FIRING_TIMEOUT,
      startup_jobs: Vec::new(),
      default_policy: JobPolicy::default(),
    }
  }

  /// Loads the configuration from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Loads the configuration through `lookup`, which maps a variable name to
  /// its value.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let database_url = lookup(DATABASE_URL_VAR)
      .filter(|v| !v.trim().is_empty())
      .ok_or(ConfigError::Missing(DATABASE_URL_VAR))?;
    let mut config = Self::new(database_url);

    if let Some(raw) = lookup(FIRING_TIMEOUT_VAR) {
      let secs: u64 = raw
        .trim()
        .parse()
        .ok()
        .filter(|s| *s > 0)
        .ok_or_else(|| ConfigError::Invalid {
          key: FIRING_TIMEOUT_VAR,
          value: raw.clone(),
        })?;
      config.firing_timeout = Duration::from_secs(secs);
    }

    if let Some(raw) = lookup(STARTUP_JOBS_VAR) {
      config.startup_jobs = raw
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect();
    }

    debug!(
      firing_timeout_secs = config.firing_timeout.as_secs(),
      startup_jobs = ?config.startup_jobs,
      "Loaded manager configuration."
    );
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |key| map.get(key).cloned()
  }

  #[test]
  fn database_url_is_required() {
    assert_eq!(
      ManagerConfig::from_lookup(lookup(&[])).unwrap_err(),
      ConfigError::Missing(DATABASE_URL_VAR)
    );
  }

  #[test]
  fn defaults_and_overrides() {
    let config = ManagerConfig::from_lookup(lookup(&[(DATABASE_URL_VAR, "postgres://db/app")])).unwrap();
    assert_eq!(config.firing_timeout, DEFAULT_FIRING_TIMEOUT);
    assert!(config.startup_jobs.is_empty());
    assert_eq!(config.default_policy, JobPolicy::default());

    let config = ManagerConfig::from_lookup(lookup(&[
      (DATABASE_URL_VAR, "postgres://db/app"),
      (FIRING_TIMEOUT_VAR, "120"),
      (STARTUP_JOBS_VAR, "sync_prices, refresh_views,,"),
    ]))
    .unwrap();
    assert_eq!(config.firing_timeout, Duration::from_secs(120));
    assert_eq!(config.startup_jobs, vec!["sync_prices", "refresh_views"]);
  }

  #[test]
  fn rejects_bad_timeout() {
    let err = ManagerConfig::from_lookup(lookup(&[
      (DATABASE_URL_VAR, "postgres://db/app"),
      (FIRING_TIMEOUT_VAR, "soon"),
    ]))
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: FIRING_TIMEOUT_VAR, .. }));
  }
}
