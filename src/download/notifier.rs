//! Advisory progress notifier for bot-attached jobs.
//!
//! Periodically edits the job's reply message while the node runs and leaves
//! a final summary line. Never on the critical path: edit failures are
//! logged and downloads continue regardless.

use std::sync::Arc;
use std::time::Duration;

use crate::client::upstream::{UpstreamClient, UpstreamError};
use crate::core::utils::format_byte;
use crate::download::task::TaskNode;

/// Interval between reply-message edits.
const EDIT_INTERVAL: Duration = Duration::from_secs(3);

fn progress_text(node: &TaskNode) -> String {
    format!(
        "Downloading... {}/{} done ({} ok, {} failed, {} skipped), {} received",
        node.finish_task(),
        node.total_task(),
        node.success_count(),
        node.failed_count(),
        node.skipped_count(),
        format_byte(node.total_download_byte()),
    )
}

fn summary_text(node: &TaskNode) -> String {
    format!(
        "Completed: {} total, {} successful, {} failed, {} skipped",
        node.total_task(),
        node.success_count(),
        node.failed_count(),
        node.skipped_count(),
    )
}

/// Spawns the notifier loop for a bot-attached node. A node without a reply
/// message id needs no notifier; the spawn is a no-op then.
pub fn spawn_notifier(client: Arc<dyn UpstreamClient>, node: Arc<TaskNode>) -> Option<tokio::task::JoinHandle<()>> {
    let reply_id = node.bot_reply_message_id?;
    let chat_id = node.from_user_id.unwrap_or(node.chat_id);

    Some(tokio::spawn(async move {
        let mut last_text = String::new();
        loop {
            tokio::time::sleep(EDIT_INTERVAL).await;
            if !node.is_running() {
                break;
            }
            let text = progress_text(&node);
            if text == last_text {
                continue;
            }
            match client.edit_message_text(chat_id, reply_id, &text).await {
                Ok(()) => last_text = text,
                Err(UpstreamError::FloodWait(secs)) => {
                    log::warn!("Notifier rate limited, waiting {}s", secs);
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                Err(e) => {
                    // Advisory only; the job does not care.
                    log::debug!("Notifier edit failed: {}", e);
                }
            }
        }

        let text = summary_text(&node);
        if let Err(e) = client.edit_message_text(chat_id, reply_id, &text).await {
            log::debug!("Notifier final edit failed: {}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::task::{DownloadStatus, TaskRegistry};

    #[test]
    fn test_progress_and_summary_text() {
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        node.register_submission(1);
        node.register_submission(2);
        node.record_outcome(1, DownloadStatus::Success);
        node.record_outcome(2, DownloadStatus::Failed);

        let progress = progress_text(&node);
        assert!(progress.contains("2/2"));
        let summary = summary_text(&node);
        assert!(summary.contains("1 successful"));
        assert!(summary.contains("1 failed"));
    }

    #[test]
    fn test_no_notifier_without_reply_message() {
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let client: Arc<dyn UpstreamClient> = Arc::new(NeverClient);
        assert!(spawn_notifier(client, node).is_none());
    }

    struct NeverClient;

    #[async_trait::async_trait]
    impl UpstreamClient for NeverClient {
        async fn get_chat(&self, _: i64) -> Result<crate::client::types::ChatInfo, UpstreamError> {
            Err(UpstreamError::Other("unused".into()))
        }
        async fn get_messages(
            &self,
            _: i64,
            _: &[i64],
        ) -> Result<Vec<crate::client::types::Message>, UpstreamError> {
            Ok(vec![])
        }
        async fn iter_dialogs(&self, _: usize, _: usize) -> Result<Vec<crate::client::types::Dialog>, UpstreamError> {
            Ok(vec![])
        }
        async fn get_chat_history(
            &self,
            _: i64,
            _: usize,
            _: i64,
        ) -> Result<Vec<crate::client::types::Message>, UpstreamError> {
            Ok(vec![])
        }
        async fn fetch_message(
            &self,
            message: &crate::client::types::Message,
        ) -> Result<crate::client::types::Message, UpstreamError> {
            Ok(message.clone())
        }
        async fn download_media(
            &self,
            _: &crate::client::types::Message,
            _: &str,
            _: Option<crate::client::upstream::ProgressFn>,
        ) -> Result<Option<String>, UpstreamError> {
            Ok(None)
        }
        async fn send_message(&self, _: i64, _: &str) -> Result<i64, UpstreamError> {
            Ok(1)
        }
        async fn edit_message_text(&self, _: i64, _: i64, _: &str) -> Result<(), UpstreamError> {
            Ok(())
        }
        async fn export_session_string(&self) -> Result<String, UpstreamError> {
            Ok(String::new())
        }
        async fn send_code(&self, _: &str) -> Result<String, UpstreamError> {
            Ok(String::new())
        }
        async fn sign_in(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<crate::client::upstream::SignInOutcome, UpstreamError> {
            Err(UpstreamError::Other("unused".into()))
        }
        async fn check_password(&self, _: &str) -> Result<crate::client::types::UserInfo, UpstreamError> {
            Err(UpstreamError::Other("unused".into()))
        }
        async fn export_login_token(&self) -> Result<crate::client::upstream::QrLogin, UpstreamError> {
            Err(UpstreamError::Other("unused".into()))
        }
        async fn me(&self) -> Result<crate::client::types::UserInfo, UpstreamError> {
            Err(UpstreamError::Other("unused".into()))
        }
        async fn disconnect(&self) {}
    }
}
