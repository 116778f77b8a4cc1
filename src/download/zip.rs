//! Per-job ZIP packaging.
//!
//! A `ZipPackager` owns a staging directory under the configured staging
//! root, pushes its message downloads through the shared worker pool and
//! packs the results into one archive once every constituent has resolved.
//! The archive is produced at most once and served at most once.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::client::upstream::UpstreamClient;
use crate::core::config;
use crate::core::error::AppResult;
use crate::core::runtime::Runtime;
use crate::core::utils::validate_title;
use crate::progress::DownloadTracker;

/// One successfully downloaded constituent.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub message_id: i64,
    pub file_path: PathBuf,
    pub archive_name: String,
    pub size: u64,
}

/// Progress view served by the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ZipStatus {
    pub manager_id: String,
    pub total: usize,
    pub downloaded: usize,
    pub failed: Vec<String>,
    pub completed: bool,
    pub ready: bool,
    pub cancelled: bool,
    pub zip_filename: Option<String>,
}

#[derive(Default)]
struct ZipState {
    downloaded_files: Vec<ZipEntry>,
    failed_downloads: Vec<String>,
    zip_ready: bool,
    zip_started: bool,
    is_cancelled: bool,
    safe_chat_title: String,
    timestamp: String,
    zip_path: Option<PathBuf>,
}

pub struct ZipPackager {
    pub manager_id: String,
    pub chat_id: i64,
    message_ids: Vec<i64>,
    temp_dir: PathBuf,
    state: Mutex<ZipState>,
}

fn lock_state(state: &Mutex<ZipState>) -> MutexGuard<'_, ZipState> {
    match state.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ZipPackager {
    pub fn new(chat_id: i64, message_ids: Vec<i64>, staging_root: &Path) -> AppResult<Arc<Self>> {
        let manager_id = format!("{}_{}", chat_id, Utc::now().timestamp_millis());
        let temp_dir = staging_root.join(format!("{}{}", config::zip::TEMP_DIR_PREFIX, Uuid::new_v4()));
        std::fs::create_dir_all(&temp_dir)?;
        log::info!(
            "ZIP manager {} created for {} message(s), staging in {}",
            manager_id,
            message_ids.len(),
            temp_dir.display()
        );
        Ok(Arc::new(Self {
            manager_id,
            chat_id,
            message_ids,
            temp_dir,
            state: Mutex::new(ZipState::default()),
        }))
    }

    /// Resolves the chat title and fixes the archive name.
    pub async fn prepare(&self, client: &Arc<dyn UpstreamClient>) {
        let safe_chat_title = match client.get_chat(self.chat_id).await {
            Ok(info) => match info.title.filter(|t| !t.is_empty()) {
                Some(title) => validate_title(&title),
                None => format!("Chat_{}", self.chat_id),
            },
            Err(e) => {
                log::warn!("Could not resolve chat {} title: {}", self.chat_id, e);
                format!("Chat_{}", self.chat_id)
            }
        };
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let zip_path = self.temp_dir.join(format!("{}_{}.zip", safe_chat_title, timestamp));

        let mut state = lock_state(&self.state);
        state.safe_chat_title = safe_chat_title;
        state.timestamp = timestamp;
        state.zip_path = Some(zip_path);
    }

    pub fn expected_zip_filename(&self) -> Option<String> {
        lock_state(&self.state)
            .zip_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    pub fn zip_path(&self) -> Option<PathBuf> {
        lock_state(&self.state).zip_path.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        lock_state(&self.state).is_cancelled
    }

    /// Submits every constituent message through the shared worker pool.
    /// Ownership of each `(chat, message)` is published to the overtake
    /// registry before the submission so an older in-flight download stops.
    pub async fn start_downloads(
        self: &Arc<Self>,
        runtime: &Arc<Runtime>,
        client: &Arc<dyn UpstreamClient>,
    ) -> AppResult<()> {
        for batch in self.message_ids.chunks(config::batch::GET_MESSAGES_LIMIT) {
            if self.is_cancelled() {
                log::info!("ZIP manager {} cancelled, stopping submissions", self.manager_id);
                return Ok(());
            }
            let messages = match client.get_messages(self.chat_id, batch).await {
                Ok(m) => m,
                Err(e) => {
                    for &message_id in batch {
                        self.on_file_failed(message_id, &format!("fetch error: {}", e)).await;
                    }
                    continue;
                }
            };

            let by_id: HashMap<i64, _> = messages.into_iter().map(|m| (m.id, m)).collect();
            for &message_id in batch {
                if self.is_cancelled() {
                    return Ok(());
                }
                match by_id.get(&message_id) {
                    Some(message) if message.has_media() => {
                        let node = runtime.tasks.alloc_with(self.chat_id, |n| {
                            n.is_custom_download = true;
                        });
                        node.set_zip_manager(&self.manager_id, message_id);
                        runtime
                            .tracker
                            .claim_zip_owner(self.chat_id, message_id, &self.manager_id);
                        runtime.queue.put(message.clone(), node).await;
                    }
                    Some(_) => {
                        self.on_file_failed(message_id, "message has no media").await;
                    }
                    None => {
                        self.on_file_failed(message_id, "message not found").await;
                    }
                }
            }
        }
        Ok(())
    }

    fn resolved(state: &ZipState) -> usize {
        state.downloaded_files.len() + state.failed_downloads.len()
    }

    /// Worker callback: one constituent landed on disk.
    pub async fn on_file_downloaded(self: &Arc<Self>, message_id: i64, file_path: PathBuf, size: u64) {
        let pack_now = {
            let mut state = lock_state(&self.state);
            let basename = file_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("message_{}", message_id));
            state.downloaded_files.push(ZipEntry {
                message_id,
                file_path,
                archive_name: format!("msg_{}_{}", message_id, basename),
                size,
            });
            Self::resolved(&state) == self.message_ids.len() && !state.zip_started && {
                state.zip_started = true;
                true
            }
        };
        if pack_now {
            self.create_zip_file().await;
        }
    }

    /// Worker callback: one constituent failed.
    pub async fn on_file_failed(self: &Arc<Self>, message_id: i64, error: &str) {
        let pack_now = {
            let mut state = lock_state(&self.state);
            state.failed_downloads.push(format!("message {}: {}", message_id, error));
            Self::resolved(&state) == self.message_ids.len() && !state.zip_started && {
                state.zip_started = true;
                true
            }
        };
        if pack_now {
            self.create_zip_file().await;
        }
    }

    /// Packs every downloaded file into the archive, deleting sources as they
    /// are added. Fires exactly once, when the last constituent resolves.
    async fn create_zip_file(self: &Arc<Self>) {
        let (entries, zip_path, cancelled) = {
            let state = lock_state(&self.state);
            (
                state.downloaded_files.clone(),
                state.zip_path.clone(),
                state.is_cancelled,
            )
        };
        if cancelled {
            log::info!("ZIP manager {} cancelled, discarding results", self.manager_id);
            self.cleanup_files();
            return;
        }
        let Some(zip_path) = zip_path else {
            log::error!("ZIP manager {} has no archive path (prepare not run)", self.manager_id);
            return;
        };
        if entries.is_empty() {
            log::warn!("ZIP manager {} finished with no downloaded files", self.manager_id);
            let mut state = lock_state(&self.state);
            state.zip_ready = false;
            return;
        }

        let manager_id = self.manager_id.clone();
        let pack_path = zip_path.clone();
        let result = tokio::task::spawn_blocking(move || pack_entries(&pack_path, &entries)).await;

        let mut state = lock_state(&self.state);
        match result {
            Ok(Ok(packed)) => {
                log::info!(
                    "ZIP manager {} packed {} file(s) into {}",
                    manager_id,
                    packed,
                    zip_path.display()
                );
                state.zip_ready = true;
            }
            Ok(Err(errors)) => {
                // Entries that failed to pack join the failure list; files
                // already packed stay in the archive.
                let packed_any = errors.len() < state.downloaded_files.len();
                state.failed_downloads.extend(errors);
                state.zip_ready = packed_any && zip_path.is_file();
            }
            Err(e) => {
                log::error!("ZIP packing task for {} failed: {}", manager_id, e);
                state.failed_downloads.push(format!("packaging failed: {}", e));
            }
        }
    }

    pub fn status(&self) -> ZipStatus {
        let state = lock_state(&self.state);
        ZipStatus {
            manager_id: self.manager_id.clone(),
            total: self.message_ids.len(),
            downloaded: state.downloaded_files.len(),
            failed: state.failed_downloads.clone(),
            completed: Self::resolved(&state) == self.message_ids.len(),
            ready: state.zip_ready,
            cancelled: state.is_cancelled,
            zip_filename: state
                .zip_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
        }
    }

    /// Stops further submissions; already-submitted work drains but its
    /// result is discarded.
    pub fn cancel(&self, tracker: &DownloadTracker) {
        {
            let mut state = lock_state(&self.state);
            state.is_cancelled = true;
        }
        tracker.release_zip_claims(&self.manager_id);
        self.cleanup_files();
    }

    /// Deletes the archive and the staging directory.
    pub fn cleanup_files(&self) {
        let zip_path = lock_state(&self.state).zip_path.clone();
        if let Some(path) = zip_path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("Failed to remove archive {}: {}", path.display(), e);
                }
            }
        }
        if self.temp_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.temp_dir) {
                log::warn!("Failed to remove temp dir {}: {}", self.temp_dir.display(), e);
            }
        }
    }

    /// The staging directory this job owns.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }
}

/// Packs entries into the archive, deleting each source after it is added.
/// Returns the number packed, or per-entry errors.
fn pack_entries(zip_path: &Path, entries: &[ZipEntry]) -> Result<usize, Vec<String>> {
    let file = match std::fs::File::create(zip_path) {
        Ok(f) => f,
        Err(e) => return Err(vec![format!("cannot create archive: {}", e)]),
    };
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut errors = Vec::new();
    let mut packed = 0usize;
    for entry in entries {
        let added = std::fs::read(&entry.file_path)
            .map_err(|e| format!("message {}: read failed: {}", entry.message_id, e))
            .and_then(|bytes| {
                writer
                    .start_file(entry.archive_name.as_str(), options)
                    .and_then(|_| writer.write_all(&bytes).map_err(zip::result::ZipError::Io))
                    .map_err(|e| format!("message {}: pack failed: {}", entry.message_id, e))
            });
        match added {
            Ok(()) => {
                packed += 1;
                if let Err(e) = std::fs::remove_file(&entry.file_path) {
                    log::warn!("Failed to remove source {}: {}", entry.file_path.display(), e);
                }
            }
            Err(e) => {
                log::error!("{}", e);
                errors.push(e);
            }
        }
    }
    if let Err(e) = writer.finish() {
        errors.push(format!("archive finalize failed: {}", e));
    }
    if errors.is_empty() {
        Ok(packed)
    } else {
        Err(errors)
    }
}

/// Registry of active ZIP managers.
pub struct ZipRegistry {
    managers: DashMap<String, Arc<ZipPackager>>,
}

impl Default for ZipRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipRegistry {
    pub fn new() -> Self {
        Self {
            managers: DashMap::new(),
        }
    }

    pub fn insert(&self, manager: Arc<ZipPackager>) {
        self.managers.insert(manager.manager_id.clone(), manager);
    }

    pub fn get(&self, manager_id: &str) -> Option<Arc<ZipPackager>> {
        self.managers.get(manager_id).map(|m| Arc::clone(&m))
    }

    /// Removes a manager from the registry (after its archive was served).
    pub fn remove(&self, manager_id: &str) -> Option<Arc<ZipPackager>> {
        self.managers.remove(manager_id).map(|(_, m)| m)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Cancels every active manager, deleting archives and temp dirs.
    pub fn cancel_all(&self, tracker: &DownloadTracker) {
        let ids: Vec<String> = self.managers.iter().map(|m| m.key().clone()).collect();
        for id in ids {
            if let Some((_, manager)) = self.managers.remove(&id) {
                manager.cancel(tracker);
            }
        }
    }

    /// Removes orphan `tgdl_zip_*` staging directories left behind by
    /// crashed or cancelled jobs. Directories of live managers survive.
    pub fn sweep_orphan_temp_dirs(&self, staging_root: &Path) -> usize {
        let live: Vec<PathBuf> = self.managers.iter().map(|m| m.temp_dir.clone()).collect();
        let Ok(entries) = std::fs::read_dir(staging_root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && name.starts_with(config::zip::TEMP_DIR_PREFIX) && !live.contains(&path) {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => {
                        removed += 1;
                        log::info!("Removed orphan ZIP temp dir {}", path.display());
                    }
                    Err(e) => log::warn!("Failed to remove orphan dir {}: {}", path.display(), e),
                }
            }
        }
        removed
    }
}
