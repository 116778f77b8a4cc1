//! Chat registry: one row per distinct chat, with the monotone
//! `last_read_message_id` high-water mark.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::now_iso;

#[derive(Debug, Clone)]
pub struct Chat {
    pub chat_id: String,
    pub chat_title: Option<String>,
    pub chat_type: Option<String>,
    pub last_read_message_id: i64,
    pub download_filter: Option<String>,
    pub upload_telegram_chat_id: Option<String>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        chat_id: row.get(0)?,
        chat_title: row.get(1)?,
        chat_type: row.get(2)?,
        last_read_message_id: row.get(3)?,
        download_filter: row.get(4)?,
        upload_telegram_chat_id: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const COLUMNS: &str = "chat_id, chat_title, chat_type, last_read_message_id, download_filter, \
                       upload_telegram_chat_id, is_active, created_at, updated_at";

pub fn find(pool: &DbPool, chat_id: &str) -> AppResult<Option<Chat>> {
    let conn = get_connection(pool)?;
    find_with_conn(&conn, chat_id)
}

pub fn find_with_conn(conn: &Connection, chat_id: &str) -> AppResult<Option<Chat>> {
    let chat = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM chats WHERE chat_id = ?1"),
            [chat_id],
            from_row,
        )
        .optional()?;
    Ok(chat)
}

pub fn find_all(pool: &DbPool, only_active: bool) -> AppResult<Vec<Chat>> {
    let conn = get_connection(pool)?;
    let sql = if only_active {
        format!("SELECT {COLUMNS} FROM chats WHERE is_active = 1 ORDER BY chat_id")
    } else {
        format!("SELECT {COLUMNS} FROM chats ORDER BY chat_id")
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Inserts or refreshes a chat row, keyed by `chat_id`.
///
/// Title and type are updated if provided; the high-water mark is never
/// touched here.
pub fn upsert(pool: &DbPool, chat_id: &str, title: Option<&str>, chat_type: Option<&str>) -> AppResult<()> {
    let conn = get_connection(pool)?;
    upsert_with_conn(&conn, chat_id, title, chat_type)
}

pub fn upsert_with_conn(
    conn: &Connection,
    chat_id: &str,
    title: Option<&str>,
    chat_type: Option<&str>,
) -> AppResult<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO chats (chat_id, chat_title, chat_type, last_read_message_id, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, 1, ?4, ?4)
         ON CONFLICT(chat_id) DO UPDATE SET
             chat_title = COALESCE(excluded.chat_title, chats.chat_title),
             chat_type = COALESCE(excluded.chat_type, chats.chat_type),
             updated_at = excluded.updated_at",
        params![chat_id, title, chat_type, now],
    )?;
    Ok(())
}

/// Advances `last_read_message_id` monotonically. A lower value is a no-op,
/// so the mark never decreases across restarts.
pub fn advance_last_read(pool: &DbPool, chat_id: &str, message_id: i64) -> AppResult<()> {
    let conn = get_connection(pool)?;
    advance_last_read_with_conn(&conn, chat_id, message_id)
}

pub fn advance_last_read_with_conn(conn: &Connection, chat_id: &str, message_id: i64) -> AppResult<()> {
    upsert_with_conn(conn, chat_id, None, None)?;
    let now = now_iso();
    conn.execute(
        "UPDATE chats
         SET last_read_message_id = MAX(last_read_message_id, ?2), updated_at = ?3
         WHERE chat_id = ?1",
        params![chat_id, message_id, now],
    )?;
    Ok(())
}

pub fn set_active(pool: &DbPool, chat_id: &str, active: bool) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE chats SET is_active = ?2, updated_at = ?3 WHERE chat_id = ?1",
        params![chat_id, active as i64, now],
    )?)
}
