//! Authorized users of the control surfaces.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::core::error::AppResult;
use crate::storage::db::{get_connection, DbPool};
use crate::storage::now_iso;

#[derive(Debug, Clone)]
pub struct AuthorizedUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub permissions: Vec<String>,
    pub is_active: bool,
    pub last_activity: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const COLUMNS: &str = "user_id, username, first_name, last_name, permissions, is_active, \
                       last_activity, created_at, updated_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<AuthorizedUser> {
    let raw_permissions: String = row.get(4)?;
    Ok(AuthorizedUser {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        permissions: serde_json::from_str(&raw_permissions).unwrap_or_default(),
        is_active: row.get::<_, i64>(5)? != 0,
        last_activity: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub fn find(pool: &DbPool, user_id: i64) -> AppResult<Option<AuthorizedUser>> {
    let conn = get_connection(pool)?;
    find_with_conn(&conn, user_id)
}

pub fn find_with_conn(conn: &Connection, user_id: i64) -> AppResult<Option<AuthorizedUser>> {
    let user = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM authorized_users WHERE user_id = ?1"),
            [user_id],
            from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn find_all(pool: &DbPool) -> AppResult<Vec<AuthorizedUser>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM authorized_users ORDER BY user_id"))?;
    let rows = stmt.query_map([], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Upserts an authorized user, idempotent on `user_id`. Profile fields are
/// refreshed; `last_activity` is bumped to now.
pub fn upsert(
    pool: &DbPool,
    user_id: i64,
    username: Option<&str>,
    first_name: Option<&str>,
    last_name: Option<&str>,
) -> AppResult<()> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    conn.execute(
        "INSERT INTO authorized_users
             (user_id, username, first_name, last_name, permissions, is_active, last_activity, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, '[]', 1, ?5, ?5, ?5)
         ON CONFLICT(user_id) DO UPDATE SET
             username = COALESCE(excluded.username, authorized_users.username),
             first_name = COALESCE(excluded.first_name, authorized_users.first_name),
             last_name = COALESCE(excluded.last_name, authorized_users.last_name),
             last_activity = excluded.last_activity,
             updated_at = excluded.updated_at",
        params![user_id, username, first_name, last_name, now],
    )?;
    Ok(())
}

pub fn touch_activity(pool: &DbPool, user_id: i64) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE authorized_users SET last_activity = ?2, updated_at = ?2 WHERE user_id = ?1",
        params![user_id, now],
    )?)
}

pub fn set_active(pool: &DbPool, user_id: i64, active: bool) -> AppResult<usize> {
    let conn = get_connection(pool)?;
    let now = now_iso();
    Ok(conn.execute(
        "UPDATE authorized_users SET is_active = ?2, updated_at = ?3 WHERE user_id = ?1",
        params![user_id, active as i64, now],
    )?)
}
