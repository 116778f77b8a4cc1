//! Normalized shapes used at the upstream boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation endpoint classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatKind {
    Group,
    Supergroup,
    Channel,
    Bot,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInfo {
    pub id: i64,
    pub title: Option<String>,
    pub kind: ChatKind,
    #[serde(default)]
    pub has_protected_content: bool,
}

/// One dialog row as returned by upstream paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dialog {
    pub chat: ChatInfo,
    pub top_message_id: i64,
    pub username: Option<String>,
    pub members_count: Option<i64>,
}

/// Media classification mirroring the upstream attachment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Voice,
    VideoNote,
    Animation,
    Sticker,
}

impl MediaKind {
    /// Canonical lowercase name, matching the `media_types` config order.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Voice => "voice",
            MediaKind::VideoNote => "video_note",
            MediaKind::Animation => "animation",
            MediaKind::Sticker => "sticker",
        }
    }

    /// Kinds whose allowed formats are constrained by `file_formats`.
    pub fn is_format_restricted(&self) -> bool {
        matches!(self, MediaKind::Audio | MediaKind::Document | MediaKind::Video)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub file_id: String,
    pub file_unique_id: String,
    pub width: u32,
    pub height: u32,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_unique_id: String,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<u32>,
    #[serde(default)]
    pub thumbs: Vec<Thumbnail>,
}

/// Normalized message record used at every boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub chat_title: Option<String>,
    pub date: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub caption_entities: Option<serde_json::Value>,
    pub media_group_id: Option<String>,
    pub media: Option<MediaInfo>,
}

impl Message {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        self.media.as_ref().map(|m| m.kind)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_names() {
        assert_eq!(MediaKind::VideoNote.as_str(), "video_note");
        assert_eq!(MediaKind::Photo.as_str(), "photo");
    }

    #[test]
    fn test_format_restricted_kinds() {
        assert!(MediaKind::Audio.is_format_restricted());
        assert!(MediaKind::Video.is_format_restricted());
        assert!(MediaKind::Document.is_format_restricted());
        assert!(!MediaKind::Photo.is_format_restricted());
        assert!(!MediaKind::Voice.is_format_restricted());
    }

    #[test]
    fn test_message_media_accessors() {
        let msg = Message {
            id: 1,
            chat_id: -100,
            chat_title: None,
            date: None,
            text: Some("hi".into()),
            caption: None,
            caption_entities: None,
            media_group_id: None,
            media: None,
        };
        assert!(!msg.has_media());
        assert_eq!(msg.media_kind(), None);
    }
}
