//! Typed runtime settings.
//!
//! Defaults come from the environment (`core::config`); any key present in
//! the `app_config` table overrides the default. Persisted state is the
//! source of truth for everything the web UI can change at runtime.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::core::{config, utils};
use crate::storage::app_config::{self, ConfigValue};
use crate::storage::db::DbPool;
use crate::AppResult;

/// Engine settings resolved at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for downloaded media
    pub save_path: PathBuf,
    /// Root directory for bot-initiated jobs
    pub bot_save_path: PathBuf,
    /// Staging directory for in-flight downloads
    pub temp_save_path: PathBuf,
    /// YAML side file mirroring custom-download history
    pub custom_history_path: PathBuf,
    /// Root under which per-job ZIP staging directories are created
    pub zip_staging_root: PathBuf,
    /// Media types considered for download, in priority order
    pub media_types: Vec<String>,
    /// Allowed file formats for audio/document/video; `["all"]` allows any
    pub file_formats: HashMap<String, Vec<String>>,
    /// Save-directory prefixes, applied in order:
    /// "chat_title", "media_datetime", "media_type"
    pub file_path_prefixes: Vec<String>,
    /// chrono format string for the media_datetime prefix
    pub date_format: String,
    /// Worker pool size
    pub max_download_task: usize,
    /// Write text-only messages to .txt files
    pub enable_download_txt: bool,
    /// Mask file names in log lines and progress reports
    pub hide_file_name: bool,
    /// HTTP control surface port
    pub web_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        let mut file_formats = HashMap::new();
        for key in ["audio", "document", "video"] {
            file_formats.insert(key.to_string(), vec!["all".to_string()]);
        }
        Self {
            save_path: PathBuf::from(utils::expand_path(&config::SAVE_PATH)),
            bot_save_path: PathBuf::from(utils::expand_path(&config::BOT_SAVE_PATH)),
            temp_save_path: PathBuf::from(utils::expand_path(&config::TEMP_SAVE_PATH)),
            custom_history_path: PathBuf::from(utils::expand_path(&config::CUSTOM_HISTORY_PATH)),
            zip_staging_root: std::env::temp_dir(),
            media_types: vec![
                "audio".to_string(),
                "document".to_string(),
                "photo".to_string(),
                "video".to_string(),
                "voice".to_string(),
                "video_note".to_string(),
            ],
            file_formats,
            file_path_prefixes: vec!["chat_title".to_string(), "media_datetime".to_string()],
            date_format: "%Y_%m".to_string(),
            max_download_task: config::workers::DEFAULT_MAX_DOWNLOAD_TASK,
            enable_download_txt: false,
            hide_file_name: false,
            web_port: *config::WEB_PORT,
        }
    }
}

impl Settings {
    /// Loads settings, overlaying persisted `app_config` values on the
    /// environment defaults.
    pub fn load(pool: &DbPool) -> AppResult<Self> {
        let mut settings = Self::default();

        if let Some(ConfigValue::Str(v)) = app_config::get(pool, "save_path")? {
            settings.save_path = PathBuf::from(utils::expand_path(&v));
        }
        if let Some(ConfigValue::Str(v)) = app_config::get(pool, "bot_save_path")? {
            settings.bot_save_path = PathBuf::from(utils::expand_path(&v));
        }
        if let Some(ConfigValue::Str(v)) = app_config::get(pool, "temp_save_path")? {
            settings.temp_save_path = PathBuf::from(utils::expand_path(&v));
        }
        if let Some(ConfigValue::List(v)) = app_config::get(pool, "media_types")? {
            if let Ok(types) = serde_json::from_value::<Vec<String>>(v) {
                if !types.is_empty() {
                    settings.media_types = types;
                }
            }
        }
        if let Some(ConfigValue::Dict(v)) = app_config::get(pool, "file_formats")? {
            if let Ok(formats) = serde_json::from_value::<HashMap<String, Vec<String>>>(v) {
                settings.file_formats.extend(formats);
            }
        }
        if let Some(ConfigValue::List(v)) = app_config::get(pool, "file_path_prefix")? {
            if let Ok(prefixes) = serde_json::from_value::<Vec<String>>(v) {
                settings.file_path_prefixes = prefixes;
            }
        }
        if let Some(ConfigValue::Str(v)) = app_config::get(pool, "date_format")? {
            settings.date_format = v;
        }
        if let Some(ConfigValue::Int(v)) = app_config::get(pool, "max_download_task")? {
            if v > 0 {
                settings.max_download_task = v as usize;
            }
        }
        if let Some(ConfigValue::Bool(v)) = app_config::get(pool, "enable_download_txt")? {
            settings.enable_download_txt = v;
        }
        if let Some(ConfigValue::Bool(v)) = app_config::get(pool, "hide_file_name")? {
            settings.hide_file_name = v;
        }
        if let Some(ConfigValue::Int(v)) = app_config::get(pool, "web_port")? {
            settings.web_port = v as u16;
        }

        log::info!(
            "Settings loaded: {} workers, media types {:?}, save path {}",
            settings.max_download_task,
            settings.media_types,
            settings.save_path.display()
        );
        Ok(settings)
    }

    /// Upstream transmission cap handed to the client factory.
    pub fn max_concurrent_transmissions(&self) -> usize {
        self.max_download_task * config::workers::TRANSMISSIONS_PER_WORKER
    }

    /// Root save directory for a job, depending on whether a bot drives it.
    pub fn base_save_path(&self, is_bot: bool) -> &PathBuf {
        if is_bot {
            &self.bot_save_path
        } else {
            &self.save_path
        }
    }
}
