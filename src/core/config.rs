use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: tgdl.db
pub static DATABASE_PATH: Lazy<String> = Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "tgdl.db".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: tgdl.log
pub static LOG_FILE_PATH: Lazy<String> = Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "tgdl.log".to_string()));

/// Root directory for downloaded media
/// Read from SAVE_PATH environment variable, supports tilde (~) expansion
pub static SAVE_PATH: Lazy<String> =
    Lazy::new(|| env::var("SAVE_PATH").unwrap_or_else(|_| "~/downloads/tgdl".to_string()));

/// Root directory for media downloaded on behalf of the control bot
/// Read from BOT_SAVE_PATH environment variable; defaults to SAVE_PATH/bot
pub static BOT_SAVE_PATH: Lazy<String> = Lazy::new(|| {
    env::var("BOT_SAVE_PATH").unwrap_or_else(|_| format!("{}/bot", SAVE_PATH.as_str()))
});

/// Staging directory for in-flight downloads before the atomic move
/// Read from TEMP_SAVE_PATH environment variable
pub static TEMP_SAVE_PATH: Lazy<String> =
    Lazy::new(|| env::var("TEMP_SAVE_PATH").unwrap_or_else(|_| "~/downloads/tgdl/.tmp".to_string()));

/// Path of the JSON file holding per-user upstream session blobs
pub static SESSION_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("SESSION_FILE_PATH").unwrap_or_else(|_| "user_sessions.json".to_string()));

/// Path of the YAML side file mirroring custom-download history.
/// The database stays authoritative; the side file is a human-readable mirror.
pub static CUSTOM_HISTORY_PATH: Lazy<String> =
    Lazy::new(|| env::var("CUSTOM_HISTORY_PATH").unwrap_or_else(|_| "custom_download_history.yaml".to_string()));

/// HTTP control surface port
/// Read from WEB_PORT environment variable
pub static WEB_PORT: Lazy<u16> = Lazy::new(|| {
    env::var("WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5001)
});

/// Upstream application credentials, required for interactive auth flows
pub static API_ID: Lazy<Option<i32>> = Lazy::new(|| env::var("TG_API_ID").ok().and_then(|v| v.parse().ok()));
pub static API_HASH: Lazy<Option<String>> = Lazy::new(|| env::var("TG_API_HASH").ok());

/// Worker pool configuration
pub mod workers {
    use super::Duration;

    /// Number of download workers when `max_download_task` is not configured
    pub const DEFAULT_MAX_DOWNLOAD_TASK: usize = 5;

    /// Concurrent upstream transmissions allowed per worker
    pub const TRANSMISSIONS_PER_WORKER: usize = 5;

    /// Interval between queue polls when the queue is empty (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 100;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }
}

/// Retry configuration for per-message downloads
pub mod retry {
    use super::Duration;

    /// Attempts per message (the outer counter; a successful byte does not
    /// reset it)
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Delay between retries after a stale reference or timeout (in seconds)
    pub const RETRY_TIMEOUT_SECS: u64 = 3;

    /// Retry delay duration
    pub fn delay() -> Duration {
        Duration::from_secs(RETRY_TIMEOUT_SECS)
    }
}

/// Pause/cancel behaviour
pub mod pause {
    use super::Duration;

    /// Maximum time a paused progress callback may hold a transfer
    /// before resuming as if unpaused (in seconds)
    pub const PAUSE_TIMEOUT_SECS: u64 = 300;

    /// Interval between pause re-checks inside the progress callback
    pub const POLL_INTERVAL_SECS: u64 = 1;

    pub fn timeout() -> Duration {
        Duration::from_secs(PAUSE_TIMEOUT_SECS)
    }
}

/// Custom-download finalizer configuration
pub mod finalizer {
    /// Interval between node status polls (in seconds)
    pub const CHECK_INTERVAL_SECS: u64 = 2;

    /// Maximum time to wait for a batch to converge (in seconds)
    pub const MAX_WAIT_SECS: u64 = 300;

    /// Placeholder total used for pending items before real progress arrives
    pub const PLACEHOLDER_TOTAL_BYTES: u64 = 50 * 1024 * 1024;

    /// Synthetic progress ramps to this fraction of the placeholder total
    pub const SYNTHETIC_PROGRESS_CAP: f64 = 0.9;

    /// Seconds over which the synthetic ramp reaches the cap
    pub const SYNTHETIC_RAMP_SECS: f64 = 30.0;
}

/// Upstream batch limits
pub mod batch {
    /// Maximum message ids per get_messages call
    pub const GET_MESSAGES_LIMIT: usize = 100;

    /// Extra messages read past a page boundary to keep a media group whole
    pub const MEDIA_GROUP_LOOKAHEAD: usize = 20;
}

/// ZIP packaging configuration
pub mod zip {
    /// Prefix for per-job staging directories under the OS temp dir
    pub const TEMP_DIR_PREFIX: &str = "tgdl_zip_";
}
