//! The bounded worker pool.
//!
//! N long-lived tasks drain the shared queue while the runtime is up. Each
//! message is processed in its own spawned task so a panic in one download
//! can never take a worker down.

use std::path::PathBuf;
use std::sync::Arc;

use crate::client::types::Message;
use crate::client::upstream::UpstreamClient;
use crate::core::config;
use crate::core::runtime::Runtime;
use crate::download::media;
use crate::download::task::{DownloadStatus, TaskNode};
use crate::progress::DownloadState;
use crate::storage::history::RecordPatch;
use crate::storage::queue::QueueStatus;
use crate::storage::{chats, history, queue as durable_queue, stats, today_stat_date};

/// Spawns the worker pool. Handles exit once `runtime.is_running()` turns
/// false and the queue has been observed empty.
pub fn spawn_workers(runtime: &Arc<Runtime>) -> Vec<tokio::task::JoinHandle<()>> {
    let count = runtime.settings.max_download_task;
    log::info!("Starting {} download workers", count);
    (0..count)
        .map(|worker_id| {
            let runtime = Arc::clone(runtime);
            tokio::spawn(async move {
                worker_loop(runtime, worker_id).await;
            })
        })
        .collect()
}

async fn worker_loop(runtime: Arc<Runtime>, worker_id: usize) {
    log::debug!("Worker {} started", worker_id);
    while runtime.is_running() {
        let Some((message, node)) = runtime.queue.take().await else {
            tokio::time::sleep(config::workers::check_interval()).await;
            continue;
        };

        if runtime.tracker.state() == DownloadState::Cancelled {
            node.stop_transmission();
            continue;
        }
        if node.is_stop_transmission() {
            continue;
        }

        let rt = Arc::clone(&runtime);
        let result = tokio::spawn(async move {
            process_message(rt, message, node).await;
        })
        .await;
        if let Err(e) = result {
            log::error!("Worker {}: message task panicked: {}", worker_id, e);
        }
    }
    log::debug!("Worker {} stopped", worker_id);
}

/// Resolves the client for a job: the node's override, else any
/// authenticated connection.
async fn client_for(runtime: &Arc<Runtime>, node: &Arc<TaskNode>) -> Option<Arc<dyn UpstreamClient>> {
    if let Some(key) = &node.client_key {
        if let Some(client) = runtime.broker.session_client(key) {
            return Some(client);
        }
    }
    if let Some(user_id) = node.from_user_id {
        if let Ok(Some(client)) = runtime.broker.get_user_client(user_id).await {
            return Some(client);
        }
    }
    runtime.broker.any_client().map(|(_, client)| client)
}

async fn process_message(runtime: Arc<Runtime>, message: Message, node: Arc<TaskNode>) {
    let chat_key = node.chat_id.to_string();
    let _ = durable_queue::mark(&runtime.db, &chat_key, message.id, QueueStatus::Processing, None);

    // Text-only fallback: custom downloads always fetch the text the user
    // picked; otherwise only when enabled. Needs no upstream client.
    let text_eligible = (runtime.settings.enable_download_txt || node.is_custom_download)
        && message.text.as_deref().is_some_and(|t| !t.is_empty())
        && !message.has_media();

    let (status, file_path) = match client_for(&runtime, &node).await {
        Some(client) => {
            let (status, file_path) =
                media::download_media(&client, &message, &runtime.settings, &runtime.tracker, &node).await;
            if text_eligible {
                media::save_text_message(&runtime.settings, &message, &node).await
            } else {
                (status, file_path)
            }
        }
        None if text_eligible => media::save_text_message(&runtime.settings, &message, &node).await,
        None => {
            log::error!(
                "No authenticated client available for message {} in chat {}",
                message.id,
                node.chat_id
            );
            (DownloadStatus::Failed, None)
        }
    };

    finish_message(&runtime, &message, &node, status, file_path).await;
}

async fn finish_message(
    runtime: &Arc<Runtime>,
    message: &Message,
    node: &Arc<TaskNode>,
    status: DownloadStatus,
    file_path: Option<PathBuf>,
) {
    let chat_key = node.chat_id.to_string();
    let file_size = file_path
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    // History is recorded for user-driven jobs; bot relays keep their own
    // reply-message trail.
    if node.from_user_id.is_none() {
        let patch = RecordPatch {
            file_name: file_path
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            file_path: file_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
            file_size: Some(file_size as i64),
            media_type: message.media_kind().map(|k| k.as_str().to_string()),
            error_message: None,
        };
        if let Err(e) = history::upsert(&runtime.db, &chat_key, message.id, status, patch).await {
            log::error!("Failed to record history for message {}: {}", message.id, e);
        }
    }

    // The high-water mark advances on success and skip alike, matching how
    // re-enabled filters behave.
    if matches!(status, DownloadStatus::Success | DownloadStatus::Skipped) {
        if let Err(e) = chats::advance_last_read(&runtime.db, &chat_key, message.id) {
            log::warn!("Failed to advance last_read for chat {}: {}", chat_key, e);
        }
    }

    if let Err(e) = stats::record_outcome(&runtime.db, &today_stat_date(), &chat_key, status, file_size) {
        log::warn!("Failed to record statistics: {}", e);
    }

    let queue_status = match status {
        DownloadStatus::Success | DownloadStatus::Skipped => QueueStatus::Completed,
        DownloadStatus::Failed => QueueStatus::Failed,
        DownloadStatus::Downloading => QueueStatus::Processing,
    };
    let _ = durable_queue::mark(&runtime.db, &chat_key, message.id, queue_status, None);

    // ZIP callbacks run before the outcome is published so the packager
    // observes its files in submission order.
    if let Some(manager_id) = node.zip_manager_id() {
        if let Some(manager) = runtime.zips.get(&manager_id) {
            let zip_message_id = node.zip_message_id().unwrap_or(message.id);
            match (&file_path, status) {
                (Some(path), DownloadStatus::Success | DownloadStatus::Skipped) => {
                    manager.on_file_downloaded(zip_message_id, path.clone(), file_size).await;
                }
                _ => {
                    manager
                        .on_file_failed(zip_message_id, &format!("download status: {}", status.as_db_str()))
                        .await;
                }
            }
        } else {
            log::warn!(
                "ZIP manager {} vanished before message {} finished",
                manager_id,
                message.id
            );
        }
    }

    node.record_outcome(message.id, status);

    if status == DownloadStatus::Success {
        if let (Some(uploader), Some(path)) = (&runtime.uploader, &file_path) {
            let uploader = Arc::clone(uploader);
            let path = path.clone();
            let joined = tokio::task::spawn_blocking(move || uploader.upload(&path)).await;
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Upload failed for message {}: {}", message.id, e),
                Err(e) => log::warn!("Upload task failed for message {}: {}", message.id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::broker::ClientBroker;
    use crate::client::factory::UnavailableFactory;
    use crate::client::session::SessionStore;
    use crate::core::settings::Settings;
    use crate::storage::db::create_pool;

    fn test_runtime(dir: &std::path::Path) -> Arc<Runtime> {
        let pool = Arc::new(create_pool(dir.join("t.db").to_str().unwrap()).unwrap());
        let mut settings = Settings::default();
        settings.save_path = dir.join("save");
        settings.bot_save_path = dir.join("bot");
        settings.temp_save_path = dir.join("tmp");
        settings.max_download_task = 2;
        let broker = Arc::new(ClientBroker::new(
            Arc::new(UnavailableFactory),
            SessionStore::open(dir.join("sessions.json")),
            settings.max_concurrent_transmissions(),
        ));
        Runtime::new(pool, settings, broker)
    }

    fn text_message(chat_id: i64, id: i64, text: &str) -> Message {
        Message {
            id,
            chat_id,
            chat_title: Some("Chat".to_string()),
            date: None,
            text: Some(text.to_string()),
            caption: None,
            caption_entities: None,
            media_group_id: None,
            media: None,
        }
    }

    #[tokio::test]
    async fn test_workers_drain_text_only_custom_job() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let handles = spawn_workers(&runtime);

        let node = runtime.tasks.alloc_with(-5, |n| n.is_custom_download = true);
        runtime
            .queue
            .put(text_message(-5, 1, "note to self"), Arc::clone(&node))
            .await;

        // Text-only custom messages need no upstream client.
        for _ in 0..50 {
            if node.is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(node.is_finished());
        assert_eq!(node.success_count(), 1);

        runtime.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_media_job_without_client_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = test_runtime(dir.path());
        let handles = spawn_workers(&runtime);

        let node = runtime.tasks.alloc(-5);
        let mut message = text_message(-5, 2, "");
        message.text = None;
        message.media = Some(crate::client::types::MediaInfo {
            kind: crate::client::types::MediaKind::Photo,
            file_id: "f".into(),
            file_unique_id: "u".into(),
            file_name: None,
            file_size: 10,
            mime_type: None,
            date: None,
            width: None,
            height: None,
            duration: None,
            thumbs: vec![],
        });
        runtime.queue.put(message, Arc::clone(&node)).await;

        for _ in 0..50 {
            if node.is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(node.is_finished());
        assert_eq!(node.failed_count(), 1);

        // The failure landed in history and the durable queue mirror.
        let record = history::find(&runtime.db, "-5", 2).unwrap().unwrap();
        assert_eq!(record.download_status, "failed");

        runtime.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
