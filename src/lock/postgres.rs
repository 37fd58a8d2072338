//! PostgreSQL advisory locks (`pg_try_advisory_lock` / `pg_advisory_unlock`).

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use tracing::{debug, warn};

use super::store::{LockKey, LockSession, LockStore};
use crate::error::LockError;

/// Lock store backed by PostgreSQL session-level advisory locks.
///
/// Every session is a dedicated connection, never a pool checkout, so the
/// session that acquires a key is the one that releases it. When a session is
/// dropped its connection is closed and the server frees every lock it held.
///
/// Sessions run with a server-side `statement_timeout`, so a lock call stuck
/// behind a wedged backend fails instead of hanging.
#[derive(Debug, Clone)]
pub struct PgLockStore {
  options: PgConnectOptions,
  statement_timeout: Duration,
}

/// Default `statement_timeout` of lock sessions.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

impl PgLockStore {
  /// Builds a store from a `postgres://` connection string.
  pub fn new(database_url: &str) -> Result<Self, LockError> {
    let options: PgConnectOptions = database_url.parse().map_err(LockError::store)?;
    Ok(Self::from_options(options))
  }

  pub fn from_options(options: PgConnectOptions) -> Self {
    Self {
      options: options.application_name("lockstep"),
      statement_timeout: STATEMENT_TIMEOUT,
    }
  }

  /// Overrides [`STATEMENT_TIMEOUT`]. Keep it below the lock manager's call
  /// timeout so the server gives up first and the session survives.
  pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
    self.statement_timeout = timeout;
    self
  }
}

// Errors after which the connection (and every advisory lock on it) is gone:
// transport failures and the server's connection-exception and
// operator-intervention shutdown classes. A cancelled statement (57014, which
// covers statement_timeout) leaves the session intact.
fn store_error(err: sqlx::Error) -> LockError {
  let lost = match &err {
    sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => true,
    sqlx::Error::Database(db) => db
      .code()
      .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
    _ => false,
  };
  if lost {
    LockError::session_lost(err)
  } else {
    LockError::store(err)
  }
}

#[async_trait]
impl LockStore for PgLockStore {
  async fn open_session(&self) -> Result<Box<dyn LockSession>, LockError> {
    let conn = self
      .options
      .clone()
      .options([("statement_timeout", self.statement_timeout.as_millis().to_string())])
      .connect()
      .await
      .map_err(LockError::store)?;
    debug!(
      statement_timeout_ms = self.statement_timeout.as_millis() as u64,
      "Opened PostgreSQL lock session."
    );
    Ok(Box::new(PgLockSession { conn: Some(conn) }))
  }
}

struct PgLockSession {
  conn: Option<PgConnection>,
}

impl PgLockSession {
  fn conn(&mut self) -> Result<&mut PgConnection, LockError> {
    self
      .conn
      .as_mut()
      .ok_or_else(|| LockError::session_lost("lock session connection already closed"))
  }
}

#[async_trait]
impl LockSession for PgLockSession {
  async fn try_lock(&mut self, key: LockKey) -> Result<bool, LockError> {
    let conn = self.conn()?;
    sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
      .bind(key)
      .fetch_one(conn)
      .await
      .map_err(store_error)
  }

  async fn unlock(&mut self, key: LockKey) -> Result<bool, LockError> {
    let conn = self.conn()?;
    sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
      .bind(key)
      .fetch_one(conn)
      .await
      .map_err(store_error)
  }
}

impl Drop for PgLockSession {
  fn drop(&mut self) {
    let Some(conn) = self.conn.take() else {
      return;
    };
    // Graceful close needs a runtime; dropping the socket also ends the session.
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close PostgreSQL lock session cleanly.");
          }
        });
      }
      Err(_) => drop(conn),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transport_failures_lose_the_session() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
    assert!(store_error(sqlx::Error::Io(io)).is_session_lost());
    assert!(store_error(sqlx::Error::Protocol("unexpected message".into())).is_session_lost());
    assert!(!store_error(sqlx::Error::RowNotFound).is_session_lost());
    assert!(store_error(sqlx::Error::RowNotFound).is_store());
  }

  #[test]
  fn url_parse_failure_is_store_error() {
    assert!(PgLockStore::new("not a url").unwrap_err().is_store());
  }
}
