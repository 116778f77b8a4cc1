//! Durable queue mirror.
//!
//! The in-memory queue drives the workers; these rows record submissions and
//! outcomes so retry bookkeeping survives a restart.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub chat_id: String,
    pub message_id: i64,
    pub priority: i64,
    pub max_retries: i64,
    pub current_retries: i64,
    pub status: String,
    pub scheduled_at: Option<String>,
    pub processed_at: Option<String>,
    pub error_message: Option<String>,
}

const COLUMNS: &str = "id, chat_id, message_id, priority, max_retries, current_retries, status, \
                       scheduled_at, processed_at, error_message";

fn from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        priority: row.get(3)?,
        max_retries: row.get(4)?,
        current_retries: row.get(5)?,
        status: row.get(6)?,
        scheduled_at: row.get(7)?,
        processed_at: row.get(8)?,
        error_message: row.get(9)?,
    })
}

/// Records a submission. Re-submitting an existing `(chat, message)` resets
/// it to pending and bumps the retry counter.
pub fn enqueue(pool: &DbPool, chat_id: &str, message_id: i64, priority: i64) -> AppResult<()> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    conn.execute(
        "INSERT INTO download_queue (chat_id, message_id, priority, status, scheduled_at)
         VALUES (?1, ?2, ?3, 'pending', ?4)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET
             status = 'pending',
             priority = excluded.priority,
             current_retries = download_queue.current_retries + 1,
             scheduled_at = excluded.scheduled_at,
             processed_at = NULL,
             error_message = NULL",
        params![chat_id, message_id, priority, now],
    )?;
    Ok(())
}

pub fn mark(
    pool: &DbPool,
    chat_id: &str,
    message_id: i64,
    status: QueueStatus,
    error_message: Option<&str>,
) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    mark_with_conn(&conn, chat_id, message_id, status, error_message)
}

pub fn mark_with_conn(
    conn: &Connection,
    chat_id: &str,
    message_id: i64,
    status: QueueStatus,
    error_message: Option<&str>,
) -> AppResult<usize> {
    let now = now_iso();
    let processed_at = match status {
        QueueStatus::Completed | QueueStatus::Failed => Some(now.clone()),
        _ => None,
    };
    Ok(conn.execute(
        "UPDATE download_queue
         SET status = ?3, processed_at = ?4, error_message = ?5
         WHERE chat_id = ?1 AND message_id = ?2",
        params![chat_id, message_id, status.as_db_str(), processed_at, error_message],
    )?)
}

pub fn find(pool: &DbPool, chat_id: &str, message_id: i64) -> AppResult<Option<QueueEntry>> {
    let conn = get_connection(pool)?;
    let entry = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM download_queue WHERE chat_id = ?1 AND message_id = ?2"),
            params![chat_id, message_id],
            from_row,
        )
        .optional()?;
    Ok(entry)
}

pub fn find_by_status(pool: &DbPool, status: QueueStatus) -> AppResult<Vec<QueueEntry>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM download_queue WHERE status = ?1 ORDER BY priority DESC, id"
    ))?;
    let rows = stmt.query_map([status.as_db_str()], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Removes terminal entries older than the cutoff; keeps the table bounded.
pub fn prune_terminal(pool: &DbPool) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    Ok(conn.execute(
        "DELETE FROM download_queue WHERE status IN ('completed', 'failed')",
        [],
    )?)
}
