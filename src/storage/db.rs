use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode};
use std::time::Duration;

use crate::core::error::{AppError, AppResult};
use crate::storage::migrations;

/// Connection timeout for pool.get() calls - prevents indefinite blocking
const CONNECTION_TIMEOUT_SECS: u64 = 1;

/// SQLite busy timeout applied to every pooled connection
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// Backoff schedule for write retries under lock contention
const WRITE_RETRY_DELAYS_SECS: [u64; 3] = [2, 4, 8];

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool
///
/// Initializes a pool of up to 10 connections in WAL mode with foreign keys
/// enforced and a 30s busy timeout, then runs schema migrations.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
pub fn create_pool(database_path: &str) -> AppResult<DbPool> {
    let path = std::path::Path::new(database_path);
    let resolved_path = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = std::env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    log::info!("Using SQLite database at {}", resolved_path.display());

    // Run migrations before pool creation to avoid holding a pooled
    // connection open across the exclusive migration lock.
    match Connection::open(database_path) {
        Ok(mut conn) => {
            if let Err(e) = migrations::run_migrations(&mut conn) {
                log::warn!("Failed to run database migrations: {}", e);
            }
        }
        Err(e) => {
            log::warn!("Failed to open database for migrations: {}", e);
        }
    }

    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\n\
             PRAGMA foreign_keys = ON;\n\
             PRAGMA busy_timeout = {};",
            BUSY_TIMEOUT_MS
        ))
    });
    let pool = Pool::builder()
        .max_size(10)
        .connection_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS))
        .build(manager)?;

    log::info!(
        "Database pool created: max_size=10, connection_timeout={}s, busy_timeout={}ms",
        CONNECTION_TIMEOUT_SECS,
        BUSY_TIMEOUT_MS
    );

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    match pool.get() {
        Ok(conn) => Ok(conn),
        Err(e) => {
            log::error!(
                "DB pool exhaustion: {} (pool state: {} idle, {} in use)",
                e,
                pool.state().idle_connections,
                pool.state().connections - pool.state().idle_connections
            );
            Err(e)
        }
    }
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

/// Runs a write operation, retrying lock-contention errors with exponential
/// backoff (2s, 4s, 8s) before surfacing the error.
///
/// Any non-contention error surfaces immediately.
pub async fn with_write_retry<T, F>(pool: &DbPool, op: F) -> AppResult<T>
where
    F: Fn(&Connection) -> rusqlite::Result<T>,
{
    let mut last_err: Option<rusqlite::Error> = None;
    for (attempt, delay_secs) in std::iter::once(None)
        .chain(WRITE_RETRY_DELAYS_SECS.iter().copied().map(Some))
        .enumerate()
    {
        if let Some(secs) = delay_secs {
            log::warn!(
                "Database is locked, retrying write in {}s (attempt {})",
                secs,
                attempt
            );
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
        let conn = get_connection(pool).map_err(AppError::from)?;
        match op(&conn) {
            Ok(v) => return Ok(v),
            Err(e) if is_lock_contention(&e) => last_err = Some(e),
            Err(e) => return Err(e.into()),
        }
    }
    match last_err {
        Some(e) => Err(e.into()),
        None => Err(AppError::Anyhow(anyhow::anyhow!("write retry loop exited without error"))),
    }
}
