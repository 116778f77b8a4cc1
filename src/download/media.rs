//! The per-message media download routine.
//!
//! Resolves names and save paths, filters by media type and allowed formats,
//! downloads to a staging file, verifies the size and atomically moves the
//! result into place. Retries are message-scoped: stale references, flood
//! waits and timeouts consume the same three-attempt budget.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use uuid::Uuid;

use crate::client::types::{MediaInfo, MediaKind, Message};
use crate::client::upstream::{ProgressFn, UpstreamClient, UpstreamError};
use crate::core::config;
use crate::core::settings::Settings;
use crate::core::utils::{truncate_filename, validate_title};
use crate::download::task::{DownloadStatus, TaskNode};
use crate::progress::DownloadTracker;

/// Everything the retry loop needs about one media attachment.
#[derive(Debug, Clone)]
pub struct MediaMeta {
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
    pub file_format: Option<String>,
    pub ui_name: String,
    pub media_size: u64,
    pub kind: MediaKind,
}

/// Derives a file extension from the mime type, falling back to the file id
/// shape when the mime is unknown.
pub fn get_extension(file_id: &str, mime_type: &str) -> String {
    let ext = match mime_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/flac" => "flac",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        _ => {
            if let Some(suffix) = mime_type.rsplit('/').next().filter(|s| !s.is_empty() && *s != mime_type) {
                return format!(".{}", suffix);
            }
            // Photo file ids have no mime; they are always JPEG on the wire.
            if file_id.is_empty() {
                "unknown"
            } else {
                "jpg"
            }
        }
    };
    format!(".{}", ext)
}

fn mime_suffix(media: &MediaInfo) -> Option<String> {
    media
        .mime_type
        .as_deref()
        .and_then(|m| m.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// True if the format passes the per-type allow list. Types without a list
/// (photo, voice, ...) always pass.
pub fn can_download(kind: MediaKind, settings: &Settings, file_format: Option<&str>) -> bool {
    if !kind.is_format_restricted() {
        return true;
    }
    let Some(allowed) = settings.file_formats.get(kind.as_str()) else {
        return true;
    };
    if allowed.first().map(String::as_str) == Some("all") {
        return true;
    }
    match file_format {
        Some(fmt) => allowed.iter().any(|a| a == fmt),
        None => false,
    }
}

fn is_exist(path: &Path) -> bool {
    path.is_file()
}

/// Builds the save directory for one attachment:
/// `{base}/{prefix dirs in configured order}`.
fn save_dir(settings: &Settings, dirname: &str, datetime_dir: &str, kind: MediaKind, is_bot: bool) -> PathBuf {
    let mut dir = settings.base_save_path(is_bot).clone();
    for prefix in &settings.file_path_prefixes {
        match prefix.as_str() {
            "chat_title" => dir.push(dirname),
            "media_datetime" => dir.push(datetime_dir),
            "media_type" => dir.push(kind.as_str()),
            other => log::warn!("Unknown save path prefix '{}', ignoring", other),
        }
    }
    dir
}

/// Resolves paths, name and format for a message's attachment.
pub fn build_media_meta(settings: &Settings, message: &Message, media: &MediaInfo, node: &TaskNode) -> MediaMeta {
    let kind = media.kind;
    let dirname = match message.chat_title.as_deref().filter(|t| !t.is_empty()) {
        Some(title) => validate_title(title),
        None => validate_title(&message.chat_id.to_string()),
    };
    let datetime_dir = message
        .date
        .map(|d| d.format(&settings.date_format).to_string())
        .unwrap_or_else(|| "0".to_string());
    let is_bot = node.from_user_id.is_some();

    let (gen_name, file_format) = if matches!(kind, MediaKind::Voice | MediaKind::VideoNote) {
        let format = mime_suffix(media).unwrap_or_else(|| "ogg".to_string());
        let stamp = media
            .date
            .or(message.date)
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "0".to_string());
        let name = validate_title(&format!("{} - {}_{}.{}", message.id, kind.as_str(), stamp, format));
        (name, Some(format))
    } else {
        let format = if kind.is_format_restricted() { mime_suffix(media) } else { None };

        let (stem, suffix) = match media.file_name.as_deref() {
            Some(name) => {
                let base = Path::new(name)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(name);
                match base.rfind('.') {
                    Some(idx) if idx > 0 => (base[..idx].to_string(), base[idx..].to_string()),
                    _ => (
                        base.to_string(),
                        get_extension(&media.file_id, media.mime_type.as_deref().unwrap_or("")),
                    ),
                }
            }
            None => {
                let stem = if kind == MediaKind::Photo {
                    media.file_unique_id.clone()
                } else {
                    String::new()
                };
                (
                    stem,
                    get_extension(&media.file_id, media.mime_type.as_deref().unwrap_or("")),
                )
            }
        };

        let name = if stem.is_empty() {
            format!("{}.{}", message.id, suffix)
        } else {
            validate_title(&format!("{} - {}{}", message.id, stem, suffix))
        };
        (name, format)
    };

    let final_dir = save_dir(settings, &dirname, &datetime_dir, kind, is_bot);
    let final_path = PathBuf::from(truncate_filename(
        &final_dir.join(&gen_name).to_string_lossy(),
    ));
    let temp_path = PathBuf::from(truncate_filename(
        &settings.temp_save_path.join(&dirname).join(&gen_name).to_string_lossy(),
    ));

    let ui_name = if settings.hide_file_name {
        let ext = final_path.extension().map(|e| e.to_string_lossy().into_owned()).unwrap_or_default();
        format!("****.{}", ext)
    } else {
        final_path.to_string_lossy().into_owned()
    };

    MediaMeta {
        final_path,
        temp_path,
        file_format,
        ui_name,
        media_size: media.file_size,
        kind,
    }
}

/// Verifies the downloaded size matches the declared size. A mismatch deletes
/// the temp file; zero-byte declared sizes pass when the file is zero bytes.
fn check_download_finish(media_size: u64, download_path: &Path, ui_file_name: &str) -> Result<(), UpstreamError> {
    let download_size = std::fs::metadata(download_path).map(|m| m.len()).unwrap_or(0);
    if media_size == download_size {
        log::info!("Successfully downloaded - {}", ui_file_name);
        Ok(())
    } else {
        log::warn!(
            "Media downloaded with wrong size: {}, actual: {}, file name: {}",
            download_size,
            media_size,
            ui_file_name
        );
        let _ = std::fs::remove_file(download_path);
        Err(UpstreamError::StaleReference)
    }
}

/// Moves the staging file to its final location, creating directories as
/// needed. Falls back to copy+delete across filesystems.
fn move_to_download_path(temp_path: &Path, final_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = final_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    match std::fs::rename(temp_path, final_path) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(temp_path, final_path)?;
            std::fs::remove_file(temp_path)
        }
    }
}

/// Writes a text-only message to `{save dir}/{message_id}.txt`.
///
/// Fires when text download is enabled or this is a custom download, and the
/// message carries no media.
pub async fn save_text_message(
    settings: &Settings,
    message: &Message,
    node: &TaskNode,
) -> (DownloadStatus, Option<PathBuf>) {
    let dirname = match message.chat_title.as_deref().filter(|t| !t.is_empty()) {
        Some(title) => validate_title(title),
        None => validate_title(&message.chat_id.to_string()),
    };
    let datetime_dir = message
        .date
        .map(|d| d.format(&settings.date_format).to_string())
        .unwrap_or_else(|| "0".to_string());
    let is_bot = node.from_user_id.is_some();

    let mut dir = settings.base_save_path(is_bot).clone();
    for prefix in &settings.file_path_prefixes {
        match prefix.as_str() {
            "chat_title" => dir.push(&dirname),
            "media_datetime" => dir.push(&datetime_dir),
            _ => {}
        }
    }
    let file_path = dir.join(format!("{}.txt", message.id));

    if is_exist(&file_path) {
        return (DownloadStatus::Skipped, Some(file_path));
    }
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::error!("Failed to create text save dir {}: {}", dir.display(), e);
        return (DownloadStatus::Failed, None);
    }
    match std::fs::write(&file_path, message.text.as_deref().unwrap_or("")) {
        Ok(()) => (DownloadStatus::Success, Some(file_path)),
        Err(e) => {
            log::error!("Failed to write text file {}: {}", file_path.display(), e);
            (DownloadStatus::Failed, None)
        }
    }
}

fn make_progress_fn(
    tracker: Arc<DownloadTracker>,
    node: Arc<TaskNode>,
    message_id: i64,
    ui_name: String,
    task_start: Instant,
) -> ProgressFn {
    Arc::new(move |down_byte, total| {
        let tracker = Arc::clone(&tracker);
        let node = Arc::clone(&node);
        let ui_name = ui_name.clone();
        async move {
            tracker
                .update_progress(down_byte, total, message_id, &ui_name, task_start, &node)
                .await
        }
        .boxed()
    })
}

/// Downloads the media of one message.
///
/// Returns the outcome and the final path when bytes landed on disk. Worker
/// scope catches nothing here: every failure path is already folded into the
/// returned status.
pub async fn download_media(
    client: &Arc<dyn UpstreamClient>,
    message: &Message,
    settings: &Settings,
    tracker: &Arc<DownloadTracker>,
    node: &Arc<TaskNode>,
) -> (DownloadStatus, Option<PathBuf>) {
    let task_start = Instant::now();

    // Refresh file references before the first attempt.
    let mut message = match client.fetch_message(message).await {
        Ok(m) => m,
        Err(e) => {
            log::error!("Message[{}]: could not be refreshed: {}", message.id, e);
            return (DownloadStatus::Failed, None);
        }
    };

    let Some(media) = message.media.clone() else {
        // Text-only handling is the caller's decision.
        return (DownloadStatus::Skipped, None);
    };

    if !settings.media_types.iter().any(|t| t == media.kind.as_str()) {
        return (DownloadStatus::Skipped, None);
    }

    let mut meta = build_media_meta(settings, &message, &media, node);

    if !can_download(meta.kind, settings, meta.file_format.as_deref()) {
        return (DownloadStatus::Skipped, None);
    }

    let is_zip_job = node.zip_manager_id().is_some();
    if is_exist(&meta.final_path) {
        if !is_zip_job {
            log::info!(
                "id={} {} already downloaded, download skipped",
                message.id,
                meta.ui_name
            );
            return (DownloadStatus::Skipped, Some(meta.final_path));
        }
        // ZIP jobs need a fresh copy; never overwrite the original.
        let redirect_dir = settings
            .temp_save_path
            .join(format!("zip_download_{}", Uuid::new_v4()));
        let basename = meta
            .final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        meta.final_path = redirect_dir.join(basename);
        log::info!(
            "id={} exists; ZIP job downloading a fresh copy to {}",
            message.id,
            meta.final_path.display()
        );
    }

    if let Some(dir) = meta.temp_path.parent() {
        if let Err(e) = std::fs::create_dir_all(dir) {
            log::error!("Failed to create temp dir {}: {}", dir.display(), e);
            return (DownloadStatus::Failed, None);
        }
    }

    for retry in 0..config::retry::MAX_ATTEMPTS {
        let progress = make_progress_fn(
            Arc::clone(tracker),
            Arc::clone(node),
            message.id,
            meta.ui_name.clone(),
            task_start,
        );
        match client
            .download_media(&message, &meta.temp_path.to_string_lossy(), Some(progress))
            .await
        {
            Ok(Some(temp_download_path)) => {
                let temp = PathBuf::from(&temp_download_path);
                match check_download_finish(meta.media_size, &temp, &meta.ui_name) {
                    Ok(()) => {
                        if let Err(e) = move_to_download_path(&temp, &meta.final_path) {
                            log::error!(
                                "Message[{}]: failed to move {} into place: {}",
                                message.id,
                                temp.display(),
                                e
                            );
                            return (DownloadStatus::Failed, None);
                        }
                        return (DownloadStatus::Success, Some(meta.final_path));
                    }
                    Err(_) => {
                        // Same handling as an expired reference: refetch and
                        // spend one attempt.
                        tokio::time::sleep(config::retry::delay()).await;
                        if let Ok(fresh) = client.fetch_message(&message).await {
                            message = fresh;
                        }
                        if retry == config::retry::MAX_ATTEMPTS - 1 {
                            log::error!("Message[{}]: size mismatch persisted, giving up", message.id);
                        }
                    }
                }
            }
            Ok(None) => {
                log::error!(
                    "Message[{}]: download produced no file, not retrying",
                    message.id
                );
                return (DownloadStatus::Failed, None);
            }
            Err(UpstreamError::StaleReference) => {
                log::warn!("Message[{}]: file reference expired, refetching...", message.id);
                tokio::time::sleep(config::retry::delay()).await;
                if let Ok(fresh) = client.fetch_message(&message).await {
                    message = fresh;
                }
                if retry == config::retry::MAX_ATTEMPTS - 1 {
                    log::error!(
                        "Message[{}]: file reference expired for {} retries, download skipped",
                        message.id,
                        config::retry::MAX_ATTEMPTS
                    );
                }
            }
            Err(UpstreamError::FloodWait(wait_secs)) => {
                log::warn!("Message[{}]: FloodWait {}s", message.id, wait_secs);
                tokio::time::sleep(std::time::Duration::from_secs(wait_secs)).await;
            }
            Err(UpstreamError::Timeout) => {
                log::warn!(
                    "Timeout while downloading Message[{}], retrying after {}s",
                    message.id,
                    config::retry::RETRY_TIMEOUT_SECS
                );
                tokio::time::sleep(config::retry::delay()).await;
                if retry == config::retry::MAX_ATTEMPTS - 1 {
                    log::error!("Message[{}]: timing out after {} retries", message.id, config::retry::MAX_ATTEMPTS);
                }
            }
            Err(UpstreamError::TransmissionStopped) => {
                log::info!("Message[{}]: transmission stopped", message.id);
                return (DownloadStatus::Failed, None);
            }
            Err(e) => {
                log::error!(
                    "Message[{}]: could not be downloaded due to following exception: [{}]",
                    message.id,
                    e
                );
                return (DownloadStatus::Failed, None);
            }
        }
    }

    (DownloadStatus::Failed, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::task::TaskRegistry;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn settings(dir: &Path) -> Settings {
        let mut s = Settings::default();
        s.save_path = dir.join("save");
        s.bot_save_path = dir.join("bot");
        s.temp_save_path = dir.join("tmp");
        s
    }

    fn video_message(id: i64) -> Message {
        Message {
            id,
            chat_id: -100123,
            chat_title: Some("Test Group".to_string()),
            date: Some(Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()),
            text: None,
            caption: None,
            caption_entities: None,
            media_group_id: None,
            media: Some(MediaInfo {
                kind: MediaKind::Video,
                file_id: "fid".into(),
                file_unique_id: "fuid".into(),
                file_name: Some("holiday clip.mp4".into()),
                file_size: 2048,
                mime_type: Some("video/mp4".into()),
                date: None,
                width: None,
                height: None,
                duration: None,
                thumbs: vec![],
            }),
        }
    }

    #[test]
    fn test_get_extension() {
        assert_eq!(get_extension("fid", "image/jpeg"), ".jpg");
        assert_eq!(get_extension("fid", "video/mp4"), ".mp4");
        assert_eq!(get_extension("fid", "application/x-tar"), ".x-tar");
        assert_eq!(get_extension("fid", ""), ".jpg");
        assert_eq!(get_extension("", ""), ".unknown");
    }

    #[test]
    fn test_can_download_allow_list() {
        let mut s = Settings::default();
        assert!(can_download(MediaKind::Video, &s, Some("mp4")));

        s.file_formats.insert("video".into(), vec!["mp4".into(), "webm".into()]);
        assert!(can_download(MediaKind::Video, &s, Some("mp4")));
        assert!(!can_download(MediaKind::Video, &s, Some("avi")));
        assert!(!can_download(MediaKind::Video, &s, None));
        // Unrestricted kinds always pass
        assert!(can_download(MediaKind::Photo, &s, None));
    }

    #[test]
    fn test_build_media_meta_video() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc(-100123);
        let msg = video_message(5);
        let media = msg.media.clone().unwrap();

        let meta = build_media_meta(&s, &msg, &media, &node);
        assert_eq!(meta.file_format.as_deref(), Some("mp4"));
        assert_eq!(meta.media_size, 2048);
        let path = meta.final_path.to_string_lossy().into_owned();
        assert!(path.contains("Test Group"));
        assert!(path.contains("2026_07"));
        assert!(path.ends_with("5 - holiday clip.mp4"));
        assert!(meta.temp_path.to_string_lossy().contains(".tmp") || meta.temp_path.starts_with(&s.temp_save_path));
    }

    #[test]
    fn test_build_media_meta_photo_without_name() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let mut msg = video_message(9);
        msg.media = Some(MediaInfo {
            kind: MediaKind::Photo,
            file_id: "fid".into(),
            file_unique_id: "AQADuniq".into(),
            file_name: None,
            file_size: 100,
            mime_type: None,
            date: None,
            width: None,
            height: None,
            duration: None,
            thumbs: vec![],
        });
        let media = msg.media.clone().unwrap();
        let meta = build_media_meta(&s, &msg, &media, &node);
        // Photos use the unique id as the stem, keeping the "{id} - " prefix
        assert!(meta
            .final_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("9 - AQADuniq"));
    }

    #[test]
    fn test_build_media_meta_nameless_document_double_dot() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let mut msg = video_message(7);
        msg.media = Some(MediaInfo {
            kind: MediaKind::Document,
            file_id: "fid".into(),
            file_unique_id: "u".into(),
            file_name: None,
            file_size: 100,
            mime_type: Some("application/pdf".into()),
            date: None,
            width: None,
            height: None,
            duration: None,
            thumbs: vec![],
        });
        let media = msg.media.clone().unwrap();
        let meta = build_media_meta(&s, &msg, &media, &node);
        // Nameless files keep the "{id}.." shape the history scanner matches
        assert_eq!(
            meta.final_path.file_name().unwrap().to_string_lossy(),
            "7..pdf"
        );
    }

    #[test]
    fn test_build_media_meta_voice_name_shape() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let mut msg = video_message(3);
        msg.media = Some(MediaInfo {
            kind: MediaKind::Voice,
            file_id: "fid".into(),
            file_unique_id: "u".into(),
            file_name: None,
            file_size: 64,
            mime_type: Some("audio/ogg".into()),
            date: Some(Utc.with_ymd_and_hms(2026, 7, 2, 8, 30, 0).unwrap()),
            width: None,
            height: None,
            duration: Some(4),
            thumbs: vec![],
        });
        let media = msg.media.clone().unwrap();
        let meta = build_media_meta(&s, &msg, &media, &node);
        let name = meta.final_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("3 - voice_"), "got {}", name);
        assert!(name.ends_with(".ogg"));
    }

    #[test]
    fn test_bot_jobs_use_bot_save_path() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc_with(-1, |n| n.from_user_id = Some(777));
        let msg = video_message(5);
        let media = msg.media.clone().unwrap();
        let meta = build_media_meta(&s, &msg, &media, &node);
        assert!(meta.final_path.starts_with(&s.bot_save_path));
    }

    #[test]
    fn test_hide_file_name_masks_ui() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.hide_file_name = true;
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let msg = video_message(5);
        let media = msg.media.clone().unwrap();
        let meta = build_media_meta(&s, &msg, &media, &node);
        assert_eq!(meta.ui_name, "****.mp4");
    }

    #[tokio::test]
    async fn test_save_text_message_and_skip_existing() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let registry = TaskRegistry::new();
        let node = registry.alloc(-1);
        let mut msg = video_message(11);
        msg.media = None;
        msg.text = Some("hello there".to_string());

        let (status, path) = save_text_message(&s, &msg, &node).await;
        assert_eq!(status, DownloadStatus::Success);
        let path = path.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello there");
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("11.txt"));

        let (status, _) = save_text_message(&s, &msg, &node).await;
        assert_eq!(status, DownloadStatus::Skipped);
    }

    #[test]
    fn test_check_download_finish_zero_byte_passes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("zero.bin");
        std::fs::write(&file, b"").unwrap();
        assert!(check_download_finish(0, &file, "zero.bin").is_ok());
        assert!(file.exists());
    }

    #[test]
    fn test_check_download_finish_mismatch_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("short.bin");
        std::fs::write(&file, b"abc").unwrap();
        assert!(check_download_finish(10, &file, "short.bin").is_err());
        assert!(!file.exists());
    }
}
