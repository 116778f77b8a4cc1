//! In-memory per-file progress, aggregate download speed and the global run
//! state.
//!
//! All map access goes through a single mutex; writes are short. The ZIP
//! overtake registry lives under the same mutex the progress path reads, so
//! a registry flip is always observed by the very next progress callback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::upstream::TransferControl;
use crate::core::config;
use crate::download::task::TaskNode;

/// Global run state driven by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DownloadState {
    Idle = 0,
    Downloading = 1,
    StopDownload = 2,
    Cancelled = 3,
    Completed = 4,
}

impl DownloadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DownloadState::Downloading,
            2 => DownloadState::StopDownload,
            3 => DownloadState::Cancelled,
            4 => DownloadState::Completed,
            _ => DownloadState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Idle => "idle",
            DownloadState::Downloading => "downloading",
            DownloadState::StopDownload => "paused",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Completed => "completed",
        }
    }
}

/// Progress of one in-flight file.
#[derive(Debug, Clone)]
pub struct FileProgress {
    pub file_name: String,
    pub total_size: u64,
    pub down_byte: u64,
    pub start_time: Instant,
    pub end_time: Instant,
    pub download_speed: u64,
    pub each_second_total_download: u64,
    pub task_id: u64,
    pub completed: bool,
}

impl FileProgress {
    pub fn percent(&self) -> u8 {
        if self.total_size == 0 {
            return 0;
        }
        ((self.down_byte.saturating_mul(100)) / self.total_size).min(100) as u8
    }
}

struct TrackerInner {
    /// chat_id → message_id → progress
    result: HashMap<i64, HashMap<i64, FileProgress>>,
    total_download_speed: u64,
    window_bytes: u64,
    window_start: Instant,
    /// (chat_id, message_id) → manager_id for in-flight ZIP downloads;
    /// newer jobs always win.
    zip_owners: HashMap<(i64, i64), String>,
}

/// Callback invoked after each progress update:
/// `(file_name, down_byte, total, speed, message_id)`.
pub type ProgressHook = Arc<dyn Fn(&str, u64, u64, u64, i64) + Send + Sync>;

pub struct DownloadTracker {
    inner: Mutex<TrackerInner>,
    state: AtomicU8,
    hook: Mutex<Option<ProgressHook>>,
    pause_timeout: Duration,
}

impl Default for DownloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                result: HashMap::new(),
                total_download_speed: 0,
                window_bytes: 0,
                window_start: Instant::now(),
                zip_owners: HashMap::new(),
            }),
            state: AtomicU8::new(DownloadState::Idle as u8),
            hook: Mutex::new(None),
            pause_timeout: config::pause::timeout(),
        }
    }

    #[cfg(test)]
    pub fn with_pause_timeout(timeout: Duration) -> Self {
        let tracker = Self::new();
        Self { pause_timeout: timeout, ..tracker }
    }

    fn lock_inner(&self) -> MutexGuard<'_, TrackerInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: DownloadState) {
        self.state.store(state as u8, Ordering::SeqCst);
        log::info!("Run state set to {}", state.as_str());
    }

    pub fn set_hook(&self, hook: ProgressHook) {
        if let Ok(mut guard) = self.hook.lock() {
            *guard = Some(hook);
        }
    }

    /// Publishes a ZIP manager as the owner of `(chat, message)`. Must happen
    /// before the download is enqueued so the old node's next progress
    /// callback observes the flip.
    pub fn claim_zip_owner(&self, chat_id: i64, message_id: i64, manager_id: &str) {
        let mut inner = self.lock_inner();
        inner.zip_owners.insert((chat_id, message_id), manager_id.to_string());
    }

    pub fn zip_owner(&self, chat_id: i64, message_id: i64) -> Option<String> {
        self.lock_inner().zip_owners.get(&(chat_id, message_id)).cloned()
    }

    /// Drops every claim held by one manager (job finished or cancelled).
    pub fn release_zip_claims(&self, manager_id: &str) {
        let mut inner = self.lock_inner();
        inner.zip_owners.retain(|_, owner| owner != manager_id);
    }

    /// Progress callback for an in-flight transfer. Returns
    /// [`TransferControl::Stop`] when the transfer must be aborted.
    ///
    /// The pause loop sleeps outside the map mutex and is bounded by the
    /// pause timeout so a forgotten pause can never hang a transfer forever.
    pub async fn update_progress(
        self: &Arc<Self>,
        down_byte: u64,
        total: u64,
        message_id: i64,
        file_name: &str,
        start_time: Instant,
        node: &Arc<TaskNode>,
    ) -> TransferControl {
        if node.is_stop_transmission() {
            return TransferControl::Stop;
        }

        // A newer ZIP job targeting the same (chat, message) overtakes this
        // transfer.
        if let Some(manager_id) = node.zip_manager_id() {
            if let Some(owner) = self.zip_owner(node.chat_id, message_id) {
                if owner != manager_id {
                    log::info!(
                        "Download of message {} in chat {} overtaken by manager {}",
                        message_id,
                        node.chat_id,
                        owner
                    );
                    node.stop_transmission();
                    return TransferControl::Stop;
                }
            }
        }

        if self.state() == DownloadState::Cancelled {
            node.stop_transmission();
            return TransferControl::Stop;
        }

        // Pause loop, bounded so a transfer is never held past the timeout.
        let pause_start = Instant::now();
        while self.state() == DownloadState::StopDownload {
            if pause_start.elapsed() >= self.pause_timeout {
                log::warn!(
                    "Pause timeout reached for message {}, resuming transfer",
                    message_id
                );
                break;
            }
            tokio::time::sleep(Duration::from_secs(config::pause::POLL_INTERVAL_SECS)).await;
            if self.state() == DownloadState::Cancelled || node.is_stop_transmission() {
                node.stop_transmission();
                return TransferControl::Stop;
            }
        }

        let now = Instant::now();
        let current_speed;
        {
            let mut inner = self.lock_inner();
            let chat_entry = inner.result.entry(node.chat_id).or_default();

            let delta = match chat_entry.get_mut(&message_id) {
                Some(entry) => {
                    // Reported bytes never go backwards.
                    let down_byte = down_byte.max(entry.down_byte);
                    let delta = down_byte - entry.down_byte;
                    entry.each_second_total_download += delta;
                    let window = now.duration_since(entry.end_time);
                    if window >= Duration::from_secs(1) {
                        entry.download_speed =
                            (entry.each_second_total_download as f64 / window.as_secs_f64()) as u64;
                        entry.each_second_total_download = 0;
                        entry.end_time = now;
                    }
                    entry.down_byte = down_byte;
                    entry.completed = total > 0 && down_byte >= total;
                    current_speed = entry.download_speed;
                    delta
                }
                None => {
                    let elapsed = now.duration_since(start_time).as_secs_f64().max(0.001);
                    let entry = FileProgress {
                        file_name: file_name.to_string(),
                        total_size: total,
                        down_byte,
                        start_time,
                        end_time: now,
                        download_speed: (down_byte as f64 / elapsed) as u64,
                        each_second_total_download: down_byte,
                        task_id: node.task_id,
                        completed: total > 0 && down_byte >= total,
                    };
                    current_speed = entry.download_speed;
                    chat_entry.insert(message_id, entry);
                    down_byte
                }
            };

            // Aggregate speed over a 1s window of net progressed bytes.
            inner.window_bytes += delta;
            let window = now.duration_since(inner.window_start);
            if window >= Duration::from_secs(1) {
                inner.total_download_speed = (inner.window_bytes as f64 / window.as_secs_f64()) as u64;
                inner.window_bytes = 0;
                inner.window_start = now;
            }
        }

        // Mirror only the increment into the owning node.
        node.add_download_bytes(message_id, down_byte);

        if let Ok(guard) = self.hook.lock() {
            if let Some(hook) = guard.as_ref() {
                (hook.as_ref())(file_name, down_byte, total, current_speed, message_id);
            }
        }

        // Completed entries linger briefly so the UI can show 100%, then are
        // removed without touching their siblings.
        if total > 0 && down_byte >= total {
            let tracker = Arc::clone(self);
            let chat_id = node.chat_id;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                tracker.remove_entry(chat_id, message_id);
            });
        }

        TransferControl::Continue
    }

    /// Seeds a placeholder entry so pending submissions are visible before
    /// real progress arrives.
    pub fn seed_entry(&self, chat_id: i64, message_id: i64, file_name: &str, total: u64, task_id: u64) {
        let mut inner = self.lock_inner();
        let chat_entry = inner.result.entry(chat_id).or_default();
        chat_entry.entry(message_id).or_insert_with(|| {
            let now = Instant::now();
            FileProgress {
                file_name: file_name.to_string(),
                total_size: total,
                down_byte: 0,
                start_time: now,
                end_time: now,
                download_speed: 0,
                each_second_total_download: 0,
                task_id,
                completed: false,
            }
        });
    }

    /// Raises a seeded entry toward `fraction` of its total; real updates
    /// that already passed that mark win.
    pub fn ramp_entry(&self, chat_id: i64, message_id: i64, fraction: f64) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.result.get_mut(&chat_id).and_then(|c| c.get_mut(&message_id)) {
            let target = (entry.total_size as f64 * fraction.clamp(0.0, 1.0)) as u64;
            if target > entry.down_byte {
                entry.down_byte = target;
                let elapsed = entry.start_time.elapsed().as_secs_f64().max(0.001);
                entry.download_speed = (target as f64 / elapsed) as u64;
                entry.end_time = Instant::now();
            }
        }
    }

    /// Marks an entry finished (down == total, end = now).
    pub fn complete_entry(&self, chat_id: i64, message_id: i64) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.result.get_mut(&chat_id).and_then(|c| c.get_mut(&message_id)) {
            entry.down_byte = entry.total_size;
            entry.end_time = Instant::now();
            entry.completed = true;
        }
    }

    pub fn remove_entry(&self, chat_id: i64, message_id: i64) {
        let mut inner = self.lock_inner();
        if let Some(chat_entry) = inner.result.get_mut(&chat_id) {
            chat_entry.remove(&message_id);
            if chat_entry.is_empty() {
                inner.result.remove(&chat_id);
            }
        }
    }

    /// Purges every entry belonging to one task.
    pub fn remove_task_entries(&self, chat_id: i64, task_id: u64) {
        let mut inner = self.lock_inner();
        if let Some(chat_entry) = inner.result.get_mut(&chat_id) {
            chat_entry.retain(|_, entry| entry.task_id != task_id);
            if chat_entry.is_empty() {
                inner.result.remove(&chat_id);
            }
        }
    }

    /// Clears all progress and claims (cancel / session reset).
    pub fn clear(&self) {
        let mut inner = self.lock_inner();
        inner.result.clear();
        inner.zip_owners.clear();
        inner.total_download_speed = 0;
        inner.window_bytes = 0;
        inner.window_start = Instant::now();
    }

    pub fn total_download_speed(&self) -> u64 {
        self.lock_inner().total_download_speed
    }

    pub fn snapshot(&self) -> Vec<(i64, i64, FileProgress)> {
        let inner = self.lock_inner();
        let mut out = Vec::new();
        for (chat_id, entries) in &inner.result {
            for (message_id, progress) in entries {
                out.push((*chat_id, *message_id, progress.clone()));
            }
        }
        out
    }

    pub fn entry(&self, chat_id: i64, message_id: i64) -> Option<FileProgress> {
        self.lock_inner()
            .result
            .get(&chat_id)
            .and_then(|c| c.get(&message_id))
            .cloned()
    }
}
