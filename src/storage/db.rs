use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::core::error::{AppError, AppResult};
use crate::storage::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Errors surfaced by the record stores.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store could not be reached within the busy/pool timeout. Retryable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// A stored row could not be decoded
    #[error("corrupt record for user {user_id}: {reason}")]
    Corrupt { user_id: i64, reason: String },

    /// A write would leave the record inconsistent
    #[error("refusing to write user {user_id}: {reason}")]
    InvariantViolation { user_id: i64, reason: String },

    /// Compare-and-set commit lost against a concurrent writer
    #[error("concurrent modification of user {0}")]
    Conflict(i64),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Unavailable(err.to_string()),
            _ => StoreError::Database(err),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Create a new database connection pool
///
/// Initializes a pool with up to 10 connections in WAL mode, each with the
/// given busy timeout, and runs schema migrations. Failure here is fatal for
/// startup.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use subgate::storage::create_pool;
///
/// let pool = create_pool("subgate.sqlite", Duration::from_secs(10))?;
/// # Ok::<(), subgate::core::AppError>(())
/// ```
pub fn create_pool(database_path: &str, busy_timeout: Duration) -> AppResult<DbPool> {
    let manager = SqliteConnectionManager::file(database_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    });
    let pool = Pool::builder()
        .max_size(10)
        .connection_timeout(busy_timeout)
        .build(manager)?;

    let mut conn = pool.get()?;
    migrations::run_migrations(&mut conn).map_err(AppError::Anyhow)?;
    log::info!("Database ready at {}", database_path);

    Ok(pool)
}

/// In-memory pool for tests and dry runs.
///
/// Every SQLite in-memory connection is its own database, so the pool holds
/// exactly one connection.
pub fn create_memory_pool() -> AppResult<DbPool> {
    let manager = SqliteConnectionManager::memory().with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)?;

    let mut conn = pool.get()?;
    migrations::run_migrations(&mut conn).map_err(AppError::Anyhow)?;

    Ok(pool)
}

/// Get a connection from the pool
pub fn get_connection(pool: &DbPool) -> StoreResult<DbConnection> {
    Ok(pool.get()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_pool_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subgate.sqlite");
        let pool = create_pool(path.to_str().unwrap(), Duration::from_secs(1)).unwrap();

        let conn = get_connection(&pool).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('users', 'payment_intents')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);

        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_reopening_existing_database_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subgate.sqlite");
        create_pool(path.to_str().unwrap(), Duration::from_secs(1)).unwrap();
        assert!(create_pool(path.to_str().unwrap(), Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_busy_error_is_retryable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let store_err = StoreError::from(err);
        assert!(store_err.is_retryable());
    }
}
