//! The shared FIFO feeding the worker pool.
//!
//! A single queue of `(message, node)` pairs; every entry was registered on
//! its node as Downloading before being put here. Workers poll the queue on
//! a short interval and drain until shutdown.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::types::Message;
use crate::download::task::TaskNode;

/// Queue size guard against unbounded memory growth. Submission batches are
/// far smaller in practice; the bound only exists for runaway submitters.
const MAX_QUEUE_SIZE: usize = 100_000;

pub struct DownloadQueue {
    queue: Mutex<VecDeque<(Message, Arc<TaskNode>)>>,
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers the message on the node and appends it to the queue.
    ///
    /// Returns false when the queue is full or the message is empty; nothing
    /// is registered in that case.
    pub async fn put(&self, message: Message, node: Arc<TaskNode>) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_QUEUE_SIZE {
            log::warn!(
                "Queue is full ({} tasks), rejecting message {} for chat {}",
                queue.len(),
                message.id,
                message.chat_id
            );
            return false;
        }
        node.register_submission(message.id);
        queue.push_back((message, node));
        true
    }

    /// Pops the oldest entry, or None when the queue is empty.
    pub async fn take(&self) -> Option<(Message, Arc<TaskNode>)> {
        let mut queue = self.queue.lock().await;
        queue.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Drops all queued entries, marking each as failed on its node so job
    /// counters still converge. Used on cancel.
    pub async fn drain(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let drained = queue.len();
        for (message, node) in queue.drain(..) {
            node.record_outcome(message.id, crate::download::task::DownloadStatus::Failed);
        }
        drained
    }
}
