use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::storage::app_config;
use crate::storage::now_iso;

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

static MIGRATION_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Schema version recorded in `app_config` after a successful run.
pub const SCHEMA_VERSION: &str = "1";

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    // Serialize migrations per-process and take an exclusive SQLite lock
    // to avoid concurrent runners interleaving on multi-instance startups.
    let guard = MIGRATION_LOCK.get_or_init(|| Mutex::new(())).lock();
    let _guard = match guard {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };

    conn.busy_timeout(Duration::from_secs(30))
        .context("set SQLite busy timeout")?;
    conn.execute_batch("BEGIN IMMEDIATE")
        .context("acquire migration lock")?;

    if let Err(err) = embedded::migrations::runner().run(conn).map(|_| ()) {
        let _ = conn.execute_batch("ROLLBACK");
        return Err(err).context("apply migrations");
    }

    conn.execute_batch("COMMIT").context("commit migrations")?;

    record_schema_version(conn).context("record schema version")?;
    Ok(())
}

fn record_schema_version(conn: &Connection) -> rusqlite::Result<()> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO app_config (key, value, value_type, description, created_at, updated_at)
         VALUES (?1, ?2, 'str', 'database schema version', ?3, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![app_config::SCHEMA_VERSION_KEY, SCHEMA_VERSION, now],
    )?;
    Ok(())
}
