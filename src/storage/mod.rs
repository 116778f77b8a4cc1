//! Persistent state: SQLite pool, migrations and entity repositories.

pub mod app_config;
pub mod chats;
pub mod custom;
pub mod db;
pub mod history;
pub mod migrations;
pub mod queue;
pub mod stats;
pub mod users;

pub use db::{create_pool, get_connection, DbConnection, DbPool};

use chrono::Utc;

/// Current time as an ISO-8601 UTC string, the canonical timestamp format
/// for every table.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Today's date as `YYYY-MM-DD`, the key for statistics rollups.
pub fn today_stat_date() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
