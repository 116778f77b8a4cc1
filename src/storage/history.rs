//! Per-(chat, message) download history.
//!
//! `upsert` on `(chat_id, message_id)` is the sole primitive that transitions
//! a message's recorded state. Rows are never deleted by the engine.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::error::AppResult;
use crate::download::task::DownloadStatus;
use crate::storage::db::{get_connection, with_write_retry, DbPool};
use crate::storage::now_iso;

#[derive(Debug, Clone)]
pub struct DownloadRecord {
    pub id: i64,
    pub chat_id: String,
    pub message_id: i64,
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: i64,
    pub media_type: Option<String>,
    pub download_status: String,
    pub error_message: Option<String>,
    pub download_date: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Patch applied by [`upsert`]; unset fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub file_name: Option<String>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub media_type: Option<String>,
    pub error_message: Option<String>,
}

const COLUMNS: &str = "id, chat_id, message_id, file_name, file_path, file_size, media_type, \
                       download_status, error_message, download_date, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<DownloadRecord> {
    Ok(DownloadRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        message_id: row.get(2)?,
        file_name: row.get(3)?,
        file_path: row.get(4)?,
        file_size: row.get(5)?,
        media_type: row.get(6)?,
        download_status: row.get(7)?,
        error_message: row.get(8)?,
        download_date: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

pub fn find(pool: &DbPool, chat_id: &str, message_id: i64) -> AppResult<Option<DownloadRecord>> {
    let conn = get_connection(pool)?;
    find_with_conn(&conn, chat_id, message_id)
}

pub fn find_with_conn(conn: &Connection, chat_id: &str, message_id: i64) -> AppResult<Option<DownloadRecord>> {
    let rec = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM download_history WHERE chat_id = ?1 AND message_id = ?2"),
            params![chat_id, message_id],
            from_row,
        )
        .optional()?;
    Ok(rec)
}

pub fn find_by_status(pool: &DbPool, chat_id: &str, status: DownloadStatus) -> AppResult<Vec<DownloadRecord>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM download_history
         WHERE chat_id = ?1 AND download_status = ?2
         ORDER BY message_id"
    ))?;
    let rows = stmt.query_map(params![chat_id, status.as_db_str()], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count(pool: &DbPool, chat_id: Option<&str>) -> AppResult<i64> {
    let conn = get_connection(pool)?;
    let count = match chat_id {
        Some(id) => conn.query_row(
            "SELECT COUNT(*) FROM download_history WHERE chat_id = ?1",
            [id],
            |row| row.get(0),
        )?,
        None => conn.query_row("SELECT COUNT(*) FROM download_history", [], |row| row.get(0))?,
    };
    Ok(count)
}

fn upsert_sql(
    conn: &Connection,
    chat_id: &str,
    message_id: i64,
    status: DownloadStatus,
    patch: &RecordPatch,
) -> rusqlite::Result<i64> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO download_history
             (chat_id, message_id, file_name, file_path, file_size, media_type,
              download_status, error_message, download_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0), ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET
             file_name = COALESCE(excluded.file_name, download_history.file_name),
             file_path = COALESCE(excluded.file_path, download_history.file_path),
             file_size = COALESCE(?5, download_history.file_size),
             media_type = COALESCE(excluded.media_type, download_history.media_type),
             download_status = excluded.download_status,
             error_message = excluded.error_message,
             download_date = excluded.download_date,
             updated_at = excluded.updated_at",
        params![
            chat_id,
            message_id,
            patch.file_name,
            patch.file_path,
            patch.file_size,
            patch.media_type,
            status.as_db_str(),
            patch.error_message,
            now,
            now,
        ],
    )?;
    conn.query_row(
        "SELECT id FROM download_history WHERE chat_id = ?1 AND message_id = ?2",
        params![chat_id, message_id],
        |row| row.get(0),
    )
}

/// Upserts the record for a message, retrying on lock contention.
pub async fn upsert(
    pool: &DbPool,
    chat_id: &str,
    message_id: i64,
    status: DownloadStatus,
    patch: RecordPatch,
) -> AppResult<i64> {
    let chat_id = chat_id.to_string();
    with_write_retry(pool, move |conn| upsert_sql(conn, &chat_id, message_id, status, &patch)).await
}

/// Synchronous upsert for callers already holding a connection.
pub fn upsert_with_conn(
    conn: &Connection,
    chat_id: &str,
    message_id: i64,
    status: DownloadStatus,
    patch: &RecordPatch,
) -> AppResult<i64> {
    Ok(upsert_sql(conn, chat_id, message_id, status, patch)?)
}

/// Message ids recorded as successful for a chat.
pub fn successful_ids(pool: &DbPool, chat_id: &str) -> AppResult<Vec<i64>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(
        "SELECT message_id FROM download_history
         WHERE chat_id = ?1 AND download_status = 'success'
         ORDER BY message_id",
    )?;
    let rows = stmt.query_map([chat_id], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Demotes a `success` record whose file disappeared from disk.
pub fn demote_missing(pool: &DbPool, chat_id: &str, message_id: i64) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE download_history
         SET download_status = 'failed',
             error_message = 'file missing on disk',
             updated_at = ?3
         WHERE chat_id = ?1 AND message_id = ?2 AND download_status = 'success'",
        params![chat_id, message_id, now],
    )?)
}
