//! The job model: a `TaskNode` aggregates many per-message downloads into
//! one logical job with progress counters and control flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Outcome of one per-message download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Success,
    Failed,
    Skipped,
}

impl DownloadStatus {
    /// Stored form in `download_history.download_status`.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DownloadStatus::Downloading => "pending",
            DownloadStatus::Success => "success",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadStatus::Downloading)
    }
}

/// One logical job: chat, limits, per-message statuses, counters and the
/// stop flag workers observe.
///
/// Shared between the submitter, the workers and the finalizer via `Arc`;
/// counters are atomics, the status map a short-lived mutex.
pub struct TaskNode {
    pub task_id: u64,
    pub chat_id: i64,
    pub from_user_id: Option<i64>,
    /// Reply message the notifier edits for bot-attached jobs
    pub bot_reply_message_id: Option<i64>,
    /// Session key overriding the default client for this job
    pub client_key: Option<String>,
    pub limit: Option<usize>,
    pub start_offset_id: i64,
    pub end_offset_id: i64,
    pub is_custom_download: bool,

    zip_manager: Mutex<Option<(String, i64)>>,
    status: Mutex<HashMap<i64, DownloadStatus>>,
    last_download_bytes: Mutex<HashMap<i64, u64>>,

    total_task: AtomicU64,
    finish_task: AtomicU64,
    success_download_task: AtomicU64,
    failed_download_task: AtomicU64,
    skip_download_task: AtomicU64,
    total_download_byte: AtomicU64,

    is_running: AtomicBool,
    is_stop_transmission: AtomicBool,
}

impl TaskNode {
    fn new(task_id: u64, chat_id: i64) -> Self {
        Self {
            task_id,
            chat_id,
            from_user_id: None,
            bot_reply_message_id: None,
            client_key: None,
            limit: None,
            start_offset_id: 0,
            end_offset_id: 0,
            is_custom_download: false,
            zip_manager: Mutex::new(None),
            status: Mutex::new(HashMap::new()),
            last_download_bytes: Mutex::new(HashMap::new()),
            total_task: AtomicU64::new(0),
            finish_task: AtomicU64::new(0),
            success_download_task: AtomicU64::new(0),
            failed_download_task: AtomicU64::new(0),
            skip_download_task: AtomicU64::new(0),
            total_download_byte: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            is_stop_transmission: AtomicBool::new(false),
        }
    }

    fn lock_status(&self) -> MutexGuard<'_, HashMap<i64, DownloadStatus>> {
        match self.status.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Records a submission: the message enters the queue as Downloading and
    /// the job is running.
    pub fn register_submission(&self, message_id: i64) {
        self.lock_status().insert(message_id, DownloadStatus::Downloading);
        self.total_task.fetch_add(1, Ordering::SeqCst);
        self.is_running.store(true, Ordering::SeqCst);
    }

    /// Records a worker outcome and advances the counters. Sets
    /// `is_running = false` once every submitted message has finished.
    pub fn record_outcome(&self, message_id: i64, status: DownloadStatus) {
        self.lock_status().insert(message_id, status);
        match status {
            DownloadStatus::Success => {
                self.success_download_task.fetch_add(1, Ordering::SeqCst);
            }
            DownloadStatus::Failed => {
                self.failed_download_task.fetch_add(1, Ordering::SeqCst);
            }
            DownloadStatus::Skipped => {
                self.skip_download_task.fetch_add(1, Ordering::SeqCst);
            }
            DownloadStatus::Downloading => return,
        }
        let finished = self.finish_task.fetch_add(1, Ordering::SeqCst) + 1;
        if finished >= self.total_task.load(Ordering::SeqCst) {
            self.is_running.store(false, Ordering::SeqCst);
        }
    }

    pub fn status_of(&self, message_id: i64) -> Option<DownloadStatus> {
        self.lock_status().get(&message_id).copied()
    }

    /// Mirrors tracker progress into the job using only the increment since
    /// the last report for this message.
    pub fn add_download_bytes(&self, message_id: i64, down_byte: u64) {
        let mut guard = match self.last_download_bytes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let last = guard.entry(message_id).or_insert(0);
        if down_byte > *last {
            self.total_download_byte.fetch_add(down_byte - *last, Ordering::SeqCst);
            *last = down_byte;
        }
    }

    pub fn set_zip_manager(&self, manager_id: &str, zip_message_id: i64) {
        if let Ok(mut guard) = self.zip_manager.lock() {
            *guard = Some((manager_id.to_string(), zip_message_id));
        }
    }

    /// Weak handle to the owning ZIP packager: just its id, resolved through
    /// the manager registry.
    pub fn zip_manager_id(&self) -> Option<String> {
        self.zip_manager.lock().ok().and_then(|g| g.as_ref().map(|(id, _)| id.clone()))
    }

    pub fn zip_message_id(&self) -> Option<i64> {
        self.zip_manager.lock().ok().and_then(|g| g.as_ref().map(|(_, id)| *id))
    }

    pub fn stop_transmission(&self) {
        self.is_stop_transmission.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_transmission(&self) -> bool {
        self.is_stop_transmission.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::SeqCst);
    }

    pub fn total_task(&self) -> u64 {
        self.total_task.load(Ordering::SeqCst)
    }

    pub fn finish_task(&self) -> u64 {
        self.finish_task.load(Ordering::SeqCst)
    }

    pub fn success_count(&self) -> u64 {
        self.success_download_task.load(Ordering::SeqCst)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_download_task.load(Ordering::SeqCst)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skip_download_task.load(Ordering::SeqCst)
    }

    pub fn total_download_byte(&self) -> u64 {
        self.total_download_byte.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        let total = self.total_task();
        total > 0 && self.finish_task() >= total
    }
}

/// Owns every live `TaskNode` and the process-unique id counter.
pub struct TaskRegistry {
    next_id: AtomicU64,
    nodes: Mutex<HashMap<u64, Arc<TaskNode>>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn lock_nodes(&self) -> MutexGuard<'_, HashMap<u64, Arc<TaskNode>>> {
        match self.nodes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Allocates a node with a fresh monotonic task id.
    pub fn alloc(&self, chat_id: i64) -> Arc<TaskNode> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(TaskNode::new(id, chat_id));
        self.lock_nodes().insert(id, Arc::clone(&node));
        node
    }

    /// Allocates a node with job metadata set before any submission.
    pub fn alloc_with(&self, chat_id: i64, configure: impl FnOnce(&mut TaskNode)) -> Arc<TaskNode> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut node = TaskNode::new(id, chat_id);
        configure(&mut node);
        let node = Arc::new(node);
        self.lock_nodes().insert(id, Arc::clone(&node));
        node
    }

    pub fn get(&self, task_id: u64) -> Option<Arc<TaskNode>> {
        self.lock_nodes().get(&task_id).cloned()
    }

    pub fn running_nodes(&self) -> Vec<Arc<TaskNode>> {
        self.lock_nodes().values().filter(|n| n.is_running()).cloned().collect()
    }

    pub fn all_nodes(&self) -> Vec<Arc<TaskNode>> {
        self.lock_nodes().values().cloned().collect()
    }

    /// Drops nodes that finished; their counters have converged and no
    /// worker references them anymore.
    pub fn prune_finished(&self) -> usize {
        let mut guard = self.lock_nodes();
        let before = guard.len();
        guard.retain(|_, node| node.is_running() || !node.is_finished());
        before - guard.len()
    }

    /// Signals every live node to stop transmitting.
    pub fn stop_all(&self) {
        for node in self.lock_nodes().values() {
            node.stop_transmission();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_task_ids_are_unique_and_monotonic() {
        let registry = TaskRegistry::new();
        let a = registry.alloc(-1);
        let b = registry.alloc(-1);
        let c = registry.alloc(-2);
        assert!(a.task_id < b.task_id);
        assert!(b.task_id < c.task_id);
    }

    #[test]
    fn test_submission_and_outcome_counters() {
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);

        for id in [1, 2, 3] {
            node.register_submission(id);
        }
        assert_eq!(node.total_task(), 3);
        assert!(node.is_running());
        assert_eq!(node.status_of(1), Some(DownloadStatus::Downloading));

        node.record_outcome(1, DownloadStatus::Success);
        node.record_outcome(2, DownloadStatus::Skipped);
        assert!(node.is_running());
        node.record_outcome(3, DownloadStatus::Failed);

        assert_eq!(node.success_count(), 1);
        assert_eq!(node.skipped_count(), 1);
        assert_eq!(node.failed_count(), 1);
        assert_eq!(node.finish_task(), 3);
        assert!(!node.is_running());
        assert!(node.is_finished());
    }

    #[test]
    fn test_download_bytes_increment_only() {
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        node.add_download_bytes(1, 100);
        node.add_download_bytes(1, 250);
        // A stale smaller report adds nothing.
        node.add_download_bytes(1, 200);
        node.add_download_bytes(2, 50);
        assert_eq!(node.total_download_byte(), 300);
    }

    #[test]
    fn test_zip_manager_weak_handle() {
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        assert_eq!(node.zip_manager_id(), None);
        node.set_zip_manager("-1_12345", 9);
        assert_eq!(node.zip_manager_id(), Some("-1_12345".to_string()));
        assert_eq!(node.zip_message_id(), Some(9));
    }

    #[test]
    fn test_prune_finished() {
        let registry = TaskRegistry::new();
        let done = registry.alloc(-1);
        done.register_submission(1);
        done.record_outcome(1, DownloadStatus::Success);

        let running = registry.alloc(-1);
        running.register_submission(1);

        assert_eq!(registry.prune_finished(), 1);
        assert!(registry.get(done.task_id).is_none());
        assert!(registry.get(running.task_id).is_some());
    }

    #[test]
    fn test_stop_all() {
        let registry = TaskRegistry::new();
        let a = registry.alloc(-1);
        let b = registry.alloc(-2);
        registry.stop_all();
        assert!(a.is_stop_transmission());
        assert!(b.is_stop_transmission());
    }

    #[test]
    fn test_db_status_strings() {
        assert_eq!(DownloadStatus::Downloading.as_db_str(), "pending");
        assert_eq!(DownloadStatus::Success.as_db_str(), "success");
        assert_eq!(DownloadStatus::Failed.as_db_str(), "failed");
        assert_eq!(DownloadStatus::Skipped.as_db_str(), "skipped");
    }
}
