//! Custom-download targets: a user-curated backlog of message ids per chat.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::now_iso;

#[derive(Debug, Clone)]
pub struct CustomDownloadConfig {
    pub id: i64,
    pub chat_id: String,
    pub target_message_ids: Vec<i64>,
    pub group_tag: Option<String>,
    pub is_enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<CustomDownloadConfig> {
    let raw_ids: String = row.get(2)?;
    let target_message_ids = serde_json::from_str(&raw_ids).unwrap_or_default();
    Ok(CustomDownloadConfig {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        target_message_ids,
        group_tag: row.get(3)?,
        is_enabled: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const COLUMNS: &str = "id, chat_id, target_message_ids, group_tag, is_enabled, created_at, updated_at";

pub fn find(pool: &DbPool, chat_id: &str) -> AppResult<Option<CustomDownloadConfig>> {
    let conn = get_connection(pool)?;
    find_with_conn(&conn, chat_id)
}

pub fn find_with_conn(conn: &Connection, chat_id: &str) -> AppResult<Option<CustomDownloadConfig>> {
    let config = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM custom_downloads WHERE chat_id = ?1"),
            [chat_id],
            from_row,
        )
        .optional()?;
    Ok(config)
}

pub fn find_all_enabled(pool: &DbPool) -> AppResult<Vec<CustomDownloadConfig>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM custom_downloads WHERE is_enabled = 1 ORDER BY chat_id"
    ))?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// All enabled targets as a `{chat_id → [message_id]}` map.
pub fn all_targets(pool: &DbPool) -> AppResult<HashMap<String, Vec<i64>>> {
    let mut targets = HashMap::new();
    for config in find_all_enabled(pool)? {
        if !config.target_message_ids.is_empty() {
            targets.insert(config.chat_id, config.target_message_ids);
        }
    }
    Ok(targets)
}

/// Appends message ids to a chat's target list, deduplicating. Returns the
/// number of ids actually added.
pub fn add_targets(pool: &DbPool, chat_id: &str, message_ids: &[i64]) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let existing = find_with_conn(&conn, chat_id)?;
    let mut ids = existing.as_ref().map(|c| c.target_message_ids.clone()).unwrap_or_default();
    let before = ids.len();
    for &id in message_ids {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    let added = ids.len() - before;
    write_targets(&conn, chat_id, &ids)?;
    Ok(added)
}

/// Removes message ids from a chat's target list (completed or confirmed
/// not-found entries). Missing ids are ignored.
pub fn remove_targets(pool: &DbPool, chat_id: &str, message_ids: &[i64]) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let Some(existing) = find_with_conn(&conn, chat_id)? else {
        return Ok(0);
    };
    let before = existing.target_message_ids.len();
    let ids: Vec<i64> = existing
        .target_message_ids
        .into_iter()
        .filter(|id| !message_ids.contains(id))
        .collect();
    let removed = before - ids.len();
    write_targets(&conn, chat_id, &ids)?;
    Ok(removed)
}

fn write_targets(conn: &Connection, chat_id: &str, ids: &[i64]) -> AppResult<()> {
    let encoded = serde_json::to_string(ids)?;
    let now = now_iso();
    conn.execute(
        "INSERT INTO custom_downloads (chat_id, target_message_ids, is_enabled, created_at, updated_at)
         VALUES (?1, ?2, 1, ?3, ?3)
         ON CONFLICT(chat_id) DO UPDATE SET
             target_message_ids = excluded.target_message_ids,
             updated_at = excluded.updated_at",
        params![chat_id, encoded, now],
    )?;
    Ok(())
}

pub fn set_enabled(pool: &DbPool, chat_id: &str, enabled: bool) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE custom_downloads SET is_enabled = ?2, updated_at = ?3 WHERE chat_id = ?1",
        params![chat_id, enabled as i64, now],
    )?)
}

pub fn set_group_tag(pool: &DbPool, chat_id: &str, tag: &str) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE custom_downloads SET group_tag = ?2, updated_at = ?3 WHERE chat_id = ?1",
        params![chat_id, tag, now],
    )?)
}
