//! Custom downloads: user-curated `{chat → [message_id]}` batches submitted
//! through the shared worker pool.
//!
//! History lives in the database (authoritative) and is mirrored to a YAML
//! side file. `is_downloaded` verifies the file is really on disk before
//! trusting history, demoting stale records so they repair themselves.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::client::upstream::{UpstreamClient, UpstreamError};
use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::core::runtime::Runtime;
use crate::core::utils::validate_title;
use crate::download::notifier;
use crate::download::task::{DownloadStatus, TaskNode};
use crate::storage::{chats, custom as custom_repo, history, queue as durable_queue};

/// Per-run outcome summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    downloaded_ids: HashMap<String, Vec<i64>>,
    #[serde(default)]
    failed_ids: HashMap<String, Vec<i64>>,
}

pub struct CustomDownloadManager {
    runtime: Arc<Runtime>,
    history_path: PathBuf,
    downloaded_ids: Mutex<HashMap<String, Vec<i64>>>,
    failed_ids: Mutex<HashMap<String, Vec<i64>>>,
    not_found: Mutex<HashSet<(String, i64)>>,
    /// (per-message node, chat key, message id) for every submission
    submissions: Mutex<Vec<(Arc<TaskNode>, String, i64)>>,
    /// Aggregate job node driving bot/UI progress
    job_node: Option<Arc<TaskNode>>,
    auth_failed: AtomicBool,
    check_interval: Duration,
    max_wait: Duration,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CustomDownloadManager {
    pub fn new(runtime: Arc<Runtime>, history_path: impl AsRef<Path>, job_node: Option<Arc<TaskNode>>) -> Self {
        let manager = Self {
            runtime,
            history_path: history_path.as_ref().to_path_buf(),
            downloaded_ids: Mutex::new(HashMap::new()),
            failed_ids: Mutex::new(HashMap::new()),
            not_found: Mutex::new(HashSet::new()),
            submissions: Mutex::new(Vec::new()),
            job_node,
            auth_failed: AtomicBool::new(false),
            check_interval: Duration::from_secs(config::finalizer::CHECK_INTERVAL_SECS),
            max_wait: Duration::from_secs(config::finalizer::MAX_WAIT_SECS),
        };
        manager.load_history();
        manager
    }

    /// True when a run hit an invalid authorization; the control surface
    /// routes the user to re-auth.
    pub fn auth_failed(&self) -> bool {
        self.auth_failed.load(Ordering::SeqCst)
    }

    fn load_history(&self) {
        match std::fs::read_to_string(&self.history_path) {
            Ok(raw) => match serde_yaml::from_str::<HistoryFile>(&raw) {
                Ok(file) => {
                    *lock(&self.downloaded_ids) = file.downloaded_ids;
                    *lock(&self.failed_ids) = file.failed_ids;
                }
                Err(e) => log::error!("Error loading history file: {}", e),
            },
            Err(_) => {
                // First run; the database still answers is_downloaded.
            }
        }
    }

    pub fn save_history(&self) {
        let file = HistoryFile {
            downloaded_ids: lock(&self.downloaded_ids).clone(),
            failed_ids: lock(&self.failed_ids).clone(),
        };
        match serde_yaml::to_string(&file) {
            Ok(encoded) => {
                if let Err(e) = std::fs::write(&self.history_path, encoded) {
                    log::error!("Error saving history file: {}", e);
                }
            }
            Err(e) => log::error!("Error saving history file: {}", e),
        }
    }

    pub fn mark_downloaded(&self, chat_id: &str, message_id: i64) {
        {
            let mut downloaded = lock(&self.downloaded_ids);
            let ids = downloaded.entry(chat_id.to_string()).or_default();
            if !ids.contains(&message_id) {
                ids.push(message_id);
            }
        }
        let mut failed = lock(&self.failed_ids);
        if let Some(ids) = failed.get_mut(chat_id) {
            ids.retain(|id| *id != message_id);
            if ids.is_empty() {
                failed.remove(chat_id);
            }
        }
    }

    pub fn mark_failed(&self, chat_id: &str, message_id: i64) {
        let mut failed = lock(&self.failed_ids);
        let ids = failed.entry(chat_id.to_string()).or_default();
        if !ids.contains(&message_id) {
            ids.push(message_id);
        }
    }

    /// Clears failed records for the given targets so failures retry, while
    /// downloaded records stay and keep existing files from re-downloading.
    pub fn clear_failed_for(&self, targets: &HashMap<String, Vec<i64>>) {
        let mut failed = lock(&self.failed_ids);
        for (chat_id, message_ids) in targets {
            if let Some(ids) = failed.get_mut(chat_id) {
                ids.retain(|id| !message_ids.contains(id));
                if ids.is_empty() {
                    failed.remove(chat_id);
                }
            }
        }
    }

    /// Candidate directory names a chat's files may live under.
    fn chat_dir_names(&self, chat_id: &str) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(Some(chat)) = chats::find(&self.runtime.db, chat_id) {
            if let Some(title) = chat.chat_title.filter(|t| !t.is_empty()) {
                names.push(validate_title(&title));
            }
        }
        if let Ok(Some(cfg)) = custom_repo::find(&self.runtime.db, chat_id) {
            if let Some(tag) = cfg.group_tag.filter(|t| !t.is_empty()) {
                let tag = validate_title(&tag);
                if !names.contains(&tag) {
                    names.push(tag);
                }
            }
        }
        names.push(validate_title(chat_id));
        names
    }

    fn file_matches(file_name: &str, message_id: i64) -> bool {
        file_name.starts_with(&format!("{} - ", message_id)) || file_name.starts_with(&format!("{}..", message_id))
    }

    fn scan_dir_for_message(dir: &Path, message_id: i64) -> bool {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return false;
        };
        let mut subdirs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_file() && Self::file_matches(&name, message_id) {
                return true;
            }
            if path.is_dir() {
                subdirs.push(path);
            }
        }
        // One level of subdirectories covers the date/type prefix layouts.
        for sub in subdirs {
            if let Ok(entries) = std::fs::read_dir(&sub) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if entry.path().is_file() && Self::file_matches(&name, message_id) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// True only when history records success *and* a matching file exists on
    /// disk. A record without a file is demoted and persisted, repairing
    /// stale history without user intervention.
    pub fn is_downloaded(&self, chat_id: &str, message_id: i64) -> bool {
        let in_memory = lock(&self.downloaded_ids)
            .get(chat_id)
            .is_some_and(|ids| ids.contains(&message_id));
        let in_db = history::find(&self.runtime.db, chat_id, message_id)
            .ok()
            .flatten()
            .is_some_and(|r| r.download_status == "success");
        if !in_memory && !in_db {
            return false;
        }

        for dir_name in self.chat_dir_names(chat_id) {
            for base in [&self.runtime.settings.save_path, &self.runtime.settings.bot_save_path] {
                if Self::scan_dir_for_message(&base.join(&dir_name), message_id) {
                    return true;
                }
            }
        }

        // No file found: demote the record so the next run re-downloads.
        {
            let mut downloaded = lock(&self.downloaded_ids);
            if let Some(ids) = downloaded.get_mut(chat_id) {
                ids.retain(|id| *id != message_id);
                if ids.is_empty() {
                    downloaded.remove(chat_id);
                }
            }
        }
        if let Err(e) = history::demote_missing(&self.runtime.db, chat_id, message_id) {
            log::warn!("Failed to demote history for message {}: {}", message_id, e);
        }
        self.save_history();
        log::info!(
            "Removed missing file from history: message {} from chat {}",
            message_id,
            chat_id
        );
        false
    }

    /// Fetches and submits every target message through the worker pool.
    pub async fn download_custom_messages(
        &self,
        client: &Arc<dyn UpstreamClient>,
        targets: &HashMap<String, Vec<i64>>,
    ) -> AppResult<()> {
        log::info!("Starting custom download for {} chats", targets.len());

        for (chat_id, message_ids) in targets {
            if message_ids.is_empty() {
                continue;
            }
            let already = message_ids.iter().filter(|id| self.is_downloaded(chat_id, **id)).count();
            log::info!(
                "Chat {}: {} total, {} marked as downloaded (file existence re-checked)",
                chat_id,
                message_ids.len(),
                already
            );
            self.download_chat_messages(client, chat_id, message_ids).await?;
        }

        self.save_history();
        Ok(())
    }

    async fn download_chat_messages(
        &self,
        client: &Arc<dyn UpstreamClient>,
        chat_id: &str,
        message_ids: &[i64],
    ) -> AppResult<()> {
        let numeric_chat_id: i64 = chat_id
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("invalid chat id: {}", chat_id)))?;

        match client.get_chat(numeric_chat_id).await {
            Ok(info) => {
                let title = info.title.clone();
                if let Err(e) = chats::upsert(
                    &self.runtime.db,
                    chat_id,
                    title.as_deref(),
                    Some(&format!("{:?}", info.kind).to_uppercase()),
                ) {
                    log::warn!("Failed to upsert chat {}: {}", chat_id, e);
                }
            }
            Err(e) => {
                log::error!("Cannot access chat {}: {}", chat_id, e);
                if matches!(e, UpstreamError::AuthKeyUnregistered) {
                    self.auth_failed.store(true, Ordering::SeqCst);
                }
                for &message_id in message_ids {
                    self.mark_failed(chat_id, message_id);
                }
                if matches!(e, UpstreamError::AuthKeyUnregistered) {
                    return Err(AppError::AuthRequired);
                }
                return Ok(());
            }
        }

        for batch in message_ids.chunks(config::batch::GET_MESSAGES_LIMIT) {
            let messages = match client.get_messages(numeric_chat_id, batch).await {
                Ok(m) => m,
                Err(e) => {
                    log::error!("Error downloading messages from chat {}: {}", chat_id, e);
                    if matches!(e, UpstreamError::AuthKeyUnregistered) {
                        self.auth_failed.store(true, Ordering::SeqCst);
                    }
                    for &message_id in batch {
                        self.mark_failed(chat_id, message_id);
                    }
                    continue;
                }
            };

            let returned: HashSet<i64> = messages.iter().map(|m| m.id).collect();
            for &message_id in batch {
                if !returned.contains(&message_id) {
                    log::warn!(
                        "Message {} not found in chat {} - marking as not found",
                        message_id,
                        chat_id
                    );
                    self.mark_failed(chat_id, message_id);
                    lock(&self.not_found).insert((chat_id.to_string(), message_id));
                }
            }

            for message in messages {
                // Per-message nodes inherit the job identity so bot-relayed
                // batches save under the bot root and use the user's client.
                let job = self.job_node.as_deref();
                let node = self.runtime.tasks.alloc_with(numeric_chat_id, |n| {
                    n.is_custom_download = true;
                    if let Some(job) = job {
                        n.from_user_id = job.from_user_id;
                        n.client_key = job.client_key.clone();
                    }
                });
                let message_id = message.id;
                let _ = durable_queue::enqueue(&self.runtime.db, chat_id, message_id, 0);
                if self.runtime.queue.put(message, Arc::clone(&node)).await {
                    lock(&self.submissions).push((node, chat_id.to_string(), message_id));
                } else {
                    self.mark_failed(chat_id, message_id);
                }
            }
        }
        Ok(())
    }

    /// Finalizer: waits for submitted work to converge, aggregates outcomes
    /// into history and the aggregate node, and prunes completed targets.
    pub async fn update_download_status(&self) -> AppResult<DownloadSummary> {
        let submissions: Vec<(Arc<TaskNode>, String, i64)> = lock(&self.submissions).clone();
        log::info!("Waiting for {} downloads to complete...", submissions.len());

        let job_task_id = self.job_node.as_ref().map(|n| n.task_id);
        if let Some(job) = &self.job_node {
            // The aggregate node mirrors the batch so bot/UI progress has
            // totals to report against.
            for (_node, _chat, message_id) in &submissions {
                job.register_submission(*message_id);
            }
        }

        // Seed pending entries so the UI shows the batch right away.
        for (node, _chat, message_id) in &submissions {
            self.runtime.tracker.seed_entry(
                node.chat_id,
                *message_id,
                &format!("message_{}.mp4", message_id),
                config::finalizer::PLACEHOLDER_TOTAL_BYTES,
                job_task_id.unwrap_or(node.task_id),
            );
        }

        let started = Instant::now();
        let mut processed: HashSet<(String, i64)> = HashSet::new();
        loop {
            let mut downloading = 0usize;
            let mut completed = 0usize;

            for (node, chat_id, message_id) in &submissions {
                match node.status_of(*message_id) {
                    Some(DownloadStatus::Downloading) | None => downloading += 1,
                    Some(status) => {
                        completed += 1;
                        let key = (chat_id.clone(), *message_id);
                        if processed.insert(key) {
                            self.runtime.tracker.complete_entry(node.chat_id, *message_id);
                            if let Some(job) = &self.job_node {
                                job.record_outcome(*message_id, status);
                            }
                        }
                    }
                }
            }

            // Synthetic ramp for items the real progress path has not
            // reached yet, capped below 100%.
            if downloading > 0 {
                let fraction = (started.elapsed().as_secs_f64() / config::finalizer::SYNTHETIC_RAMP_SECS)
                    .min(config::finalizer::SYNTHETIC_PROGRESS_CAP);
                for (node, chat_id, message_id) in &submissions {
                    if !processed.contains(&(chat_id.clone(), *message_id)) {
                        self.runtime.tracker.ramp_entry(node.chat_id, *message_id, fraction);
                    }
                }
            }

            if completed == submissions.len() {
                log::info!("All downloads completed");
                break;
            }
            if started.elapsed() >= self.max_wait {
                log::warn!(
                    "Finalizer timed out with {} downloads still pending",
                    submissions.len() - completed
                );
                break;
            }
            tokio::time::sleep(self.check_interval).await;
        }

        // Final accounting.
        let mut summary = DownloadSummary::default();
        let not_found = lock(&self.not_found).clone();
        for (node, chat_id, message_id) in &submissions {
            summary.total += 1;
            match node.status_of(*message_id) {
                Some(DownloadStatus::Success) | Some(DownloadStatus::Skipped) => {
                    self.mark_downloaded(chat_id, *message_id);
                    summary.successful += 1;
                }
                _ => {
                    self.mark_failed(chat_id, *message_id);
                    summary.failed += 1;
                }
            }
        }
        summary.total += not_found.len();
        summary.failed += not_found.len();

        // Prune completed and not-found ids from the persistent target list.
        let mut prune: HashMap<String, Vec<i64>> = HashMap::new();
        for (node_chat, message_id) in &not_found {
            prune.entry(node_chat.clone()).or_default().push(*message_id);
        }
        for (_node, chat_id, message_id) in &submissions {
            if self.is_downloaded(chat_id, *message_id) {
                prune.entry(chat_id.clone()).or_default().push(*message_id);
            }
        }
        for (chat_id, ids) in &prune {
            match custom_repo::remove_targets(&self.runtime.db, chat_id, ids) {
                Ok(removed) if removed > 0 => {
                    log::info!("Pruned {} completed/not-found targets from chat {}", removed, chat_id)
                }
                Ok(_) => {}
                Err(e) => log::error!("Error updating target ids for chat {}: {}", chat_id, e),
            }
        }
        lock(&self.not_found).clear();

        // Release the aggregate node and purge its progress entries.
        if let Some(job) = &self.job_node {
            job.set_running(false);
            for (node, _chat, _id) in &submissions {
                self.runtime.tracker.remove_task_entries(node.chat_id, job.task_id);
            }
        }
        for (node, _chat, message_id) in &submissions {
            self.runtime.tracker.remove_entry(node.chat_id, *message_id);
        }

        self.save_history();
        lock(&self.submissions).clear();

        if summary.failed > 0 {
            log::info!(
                "Download completed: {} successful, {} failed",
                summary.successful,
                summary.failed
            );
        } else {
            log::info!(
                "Download completed: All {} items finished successfully",
                summary.successful
            );
        }
        Ok(summary)
    }
}

/// Runs the full custom-download backlog from persistent targets.
pub async fn run_custom_download(
    runtime: &Arc<Runtime>,
    client: &Arc<dyn UpstreamClient>,
    job_node: Option<Arc<TaskNode>>,
) -> AppResult<DownloadSummary> {
    let targets = custom_repo::all_targets(&runtime.db)?;
    if targets.is_empty() {
        log::info!("No target IDs specified for custom download");
        return Ok(DownloadSummary::default());
    }
    run_targets(runtime, client, targets, job_node).await
}

/// Runs a caller-supplied subset of targets.
pub async fn run_for_selected(
    runtime: &Arc<Runtime>,
    client: &Arc<dyn UpstreamClient>,
    selected: HashMap<String, Vec<i64>>,
    job_node: Option<Arc<TaskNode>>,
) -> AppResult<DownloadSummary> {
    if selected.is_empty() {
        log::info!("No selected target IDs specified");
        return Ok(DownloadSummary::default());
    }
    run_targets(runtime, client, selected, job_node).await
}

async fn run_targets(
    runtime: &Arc<Runtime>,
    client: &Arc<dyn UpstreamClient>,
    targets: HashMap<String, Vec<i64>>,
    job_node: Option<Arc<TaskNode>>,
) -> AppResult<DownloadSummary> {
    // Bot-attached jobs get the advisory notifier; it runs until the
    // finalizer releases the node.
    if let Some(job) = &job_node {
        job.set_running(true);
        let _ = notifier::spawn_notifier(Arc::clone(client), Arc::clone(job));
    }

    let history_path = runtime.settings.custom_history_path.clone();
    let job_for_cleanup = job_node.clone();
    let manager = CustomDownloadManager::new(Arc::clone(runtime), history_path, job_node);

    // Failed records retry; downloaded records keep their files untouched.
    log::info!("Clearing failed download records for re-download...");
    manager.clear_failed_for(&targets);
    manager.save_history();

    if let Err(e) = manager.download_custom_messages(client, &targets).await {
        // Release the job so the notifier does not spin on a dead run.
        if let Some(job) = &job_for_cleanup {
            job.set_running(false);
        }
        return Err(e);
    }
    manager.update_download_status().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::broker::ClientBroker;
    use crate::client::factory::UnavailableFactory;
    use crate::client::session::SessionStore;
    use crate::core::settings::Settings;
    use crate::storage::db::create_pool;
    use crate::storage::history::RecordPatch;
    use pretty_assertions::assert_eq;

    fn test_runtime(dir: &Path) -> Arc<Runtime> {
        let pool = Arc::new(create_pool(dir.join("t.db").to_str().unwrap()).unwrap());
        let mut settings = Settings::default();
        settings.save_path = dir.join("save");
        settings.bot_save_path = dir.join("bot");
        settings.temp_save_path = dir.join("tmp");
        let broker = Arc::new(ClientBroker::new(
            Arc::new(UnavailableFactory),
            SessionStore::open(dir.join("sessions.json")),
            settings.max_concurrent_transmissions(),
        ));
        Runtime::new(pool, settings, broker)
    }

    fn manager(runtime: &Arc<Runtime>, dir: &Path) -> CustomDownloadManager {
        CustomDownloadManager::new(Arc::clone(runtime), dir.join("history.yaml"), None)
    }

    #[test]
    fn test_mark_downloaded_clears_failed() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let m = manager(&runtime, dir.path());

        m.mark_failed("-1", 5);
        m.mark_downloaded("-1", 5);
        assert!(lock(&m.failed_ids).get("-1").is_none());
        assert!(lock(&m.downloaded_ids).get("-1").unwrap().contains(&5));
    }

    #[test]
    fn test_history_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        {
            let m = manager(&runtime, dir.path());
            m.mark_downloaded("-1", 1);
            m.mark_failed("-1", 2);
            m.save_history();
        }
        let m = manager(&runtime, dir.path());
        assert!(lock(&m.downloaded_ids).get("-1").unwrap().contains(&1));
        assert!(lock(&m.failed_ids).get("-1").unwrap().contains(&2));
    }

    #[tokio::test]
    async fn test_is_downloaded_demotes_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let m = manager(&runtime, dir.path());

        // History says success but no file exists anywhere.
        history::upsert(&runtime.db, "-1", 5, DownloadStatus::Success, RecordPatch::default())
            .await
            .unwrap();
        assert!(!m.is_downloaded("-1", 5));

        // The record was demoted in the database.
        let record = history::find(&runtime.db, "-1", 5).unwrap().unwrap();
        assert_eq!(record.download_status, "failed");
    }

    #[tokio::test]
    async fn test_is_downloaded_finds_file_in_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let m = manager(&runtime, dir.path());

        chats::upsert(&runtime.db, "-1", Some("My Chat"), None).unwrap();
        history::upsert(&runtime.db, "-1", 8, DownloadStatus::Success, RecordPatch::default())
            .await
            .unwrap();

        let sub = runtime.settings.save_path.join("My Chat").join("2026_07");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("8 - clip.mp4"), b"data").unwrap();

        assert!(m.is_downloaded("-1", 8));
        // Still success after the check.
        let record = history::find(&runtime.db, "-1", 8).unwrap().unwrap();
        assert_eq!(record.download_status, "success");
    }

    #[test]
    fn test_file_matches_both_prefix_shapes() {
        assert!(CustomDownloadManager::file_matches("5 - holiday.mp4", 5));
        assert!(CustomDownloadManager::file_matches("5..jpg", 5));
        assert!(!CustomDownloadManager::file_matches("15 - holiday.mp4", 5));
        assert!(!CustomDownloadManager::file_matches("50.jpg", 5));
    }

    #[test]
    fn test_clear_failed_for_only_targets() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let m = manager(&runtime, dir.path());
        m.mark_failed("-1", 1);
        m.mark_failed("-1", 2);
        m.mark_failed("-2", 3);

        let mut targets = HashMap::new();
        targets.insert("-1".to_string(), vec![1]);
        m.clear_failed_for(&targets);

        assert_eq!(lock(&m.failed_ids).get("-1").unwrap(), &vec![2]);
        assert_eq!(lock(&m.failed_ids).get("-2").unwrap(), &vec![3]);
    }
}
