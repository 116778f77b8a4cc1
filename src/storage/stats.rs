//! Daily per-chat statistics rollups.

use rusqlite::{params, OptionalExtension, Row};

use crate::core::error::AppResult;
use crate::download::task::DownloadStatus;
use crate::storage::db::{get_connection, DbPool};

#[derive(Debug, Clone, Default)]
pub struct StatRow {
    pub stat_date: String,
    pub chat_id: Option<String>,
    pub total_messages: i64,
    pub successful_downloads: i64,
    pub failed_downloads: i64,
    pub skipped_downloads: i64,
    pub total_file_size: i64,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<StatRow> {
    Ok(StatRow {
        stat_date: row.get(0)?,
        chat_id: row.get(1)?,
        total_messages: row.get(2)?,
        successful_downloads: row.get(3)?,
        failed_downloads: row.get(4)?,
        skipped_downloads: row.get(5)?,
        total_file_size: row.get(6)?,
    })
}

/// Folds one download outcome into the rollup for `(stat_date, chat_id)`.
pub fn record_outcome(
    pool: &DbPool,
    stat_date: &str,
    chat_id: &str,
    status: DownloadStatus,
    file_size: u64,
) -> AppResult<()> {
    let (success, failed, skipped) = match status {
        DownloadStatus::Success => (1, 0, 0),
        DownloadStatus::Failed => (0, 1, 0),
        DownloadStatus::Skipped => (0, 0, 1),
        DownloadStatus::Downloading => (0, 0, 0),
    };
    let size = if status == DownloadStatus::Success { file_size as i64 } else { 0 };

    let conn = get_connection(pool)?;
    conn.execute(
        "INSERT INTO app_statistics
             (stat_date, chat_id, total_messages, successful_downloads, failed_downloads,
              skipped_downloads, total_file_size)
         VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)
         ON CONFLICT(stat_date, chat_id) DO UPDATE SET
             total_messages = app_statistics.total_messages + 1,
             successful_downloads = app_statistics.successful_downloads + ?3,
             failed_downloads = app_statistics.failed_downloads + ?4,
             skipped_downloads = app_statistics.skipped_downloads + ?5,
             total_file_size = app_statistics.total_file_size + ?6",
        params![stat_date, chat_id, success, failed, skipped, size],
    )?;
    Ok(())
}

pub fn find(pool: &DbPool, stat_date: &str, chat_id: &str) -> AppResult<Option<StatRow>> {
    let conn = get_connection(pool)?;
    let row = conn
        .query_row(
            "SELECT stat_date, chat_id, total_messages, successful_downloads, failed_downloads,
                    skipped_downloads, total_file_size
             FROM app_statistics WHERE stat_date = ?1 AND chat_id = ?2",
            params![stat_date, chat_id],
            from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn find_by_date(pool: &DbPool, stat_date: &str) -> AppResult<Vec<StatRow>> {
    let conn = get_connection(pool)?;
    let mut stmt = conn.prepare(
        "SELECT stat_date, chat_id, total_messages, successful_downloads, failed_downloads,
                skipped_downloads, total_file_size
         FROM app_statistics WHERE stat_date = ?1 ORDER BY chat_id",
    )?;
    let rows = stmt.query_map([stat_date], from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::create_pool;
    use pretty_assertions::assert_eq;

    fn pool() -> (tempfile::TempDir, DbPool) {
        let dir = tempfile::tempdir().unwrap();
        let p = create_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        (dir, p)
    }

    #[test]
    fn test_rollup_accumulates_per_day_and_chat() {
        let (_d, pool) = pool();
        record_outcome(&pool, "2026-08-01", "-1", DownloadStatus::Success, 100).unwrap();
        record_outcome(&pool, "2026-08-01", "-1", DownloadStatus::Success, 200).unwrap();
        record_outcome(&pool, "2026-08-01", "-1", DownloadStatus::Failed, 0).unwrap();
        record_outcome(&pool, "2026-08-01", "-1", DownloadStatus::Skipped, 999).unwrap();

        let row = find(&pool, "2026-08-01", "-1").unwrap().unwrap();
        assert_eq!(row.total_messages, 4);
        assert_eq!(row.successful_downloads, 2);
        assert_eq!(row.failed_downloads, 1);
        assert_eq!(row.skipped_downloads, 1);
        // Only successful downloads contribute bytes
        assert_eq!(row.total_file_size, 300);
    }

    #[test]
    fn test_rollup_separate_chats() {
        let (_d, pool) = pool();
        record_outcome(&pool, "2026-08-01", "-1", DownloadStatus::Success, 1).unwrap();
        record_outcome(&pool, "2026-08-01", "-2", DownloadStatus::Success, 2).unwrap();

        assert_eq!(find_by_date(&pool, "2026-08-01").unwrap().len(), 2);
    }
}
