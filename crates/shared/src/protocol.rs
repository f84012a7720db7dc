use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, MediaType, MessageId, PresenceStatus, TypingState, UserId};

pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 3;
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_BODY_CHARS: usize = 4000;
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const MAX_FILENAME_BYTES: usize = 180;

/// Attachment names end up inside a quoted `Content-Disposition` value, so
/// path separators, quotes and control characters are refused.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_BYTES
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '"') || c.is_control())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    pub url: String,
    pub media_type: MediaType,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_display_name: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub sent_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    /// Total order used everywhere messages are sorted: `sent_at`, then `id`.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.sent_at, self.id.clone())
    }

    pub fn cursor(&self) -> PageCursor {
        PageCursor {
            sent_at: self.sent_at,
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub sent_at: DateTime<Utc>,
    pub id: MessageId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
    /// Newest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
    pub typing_state: TypingState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: Message,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        id: MessageId,
    },
    PresenceChanged {
        presence: PresenceRecord,
    },
    TypingChanged {
        user_id: UserId,
        typing_state: TypingState,
    },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::MessageCreated { .. } => "message_created",
            ServerEvent::MessageEdited { .. } => "message_edited",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::PresenceChanged { .. } => "presence_changed",
            ServerEvent::TypingChanged { .. } => "typing_changed",
        }
    }
}

/// Everything written to the push stream. Keepalives are transport frames and
/// never reach the reconciliation layer as domain events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "data", rename_all = "snake_case")]
pub enum StreamFrame {
    Event(ServerEvent),
    Keepalive { sent_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub id: MessageId,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub user_id: UserId,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRequest {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    pub user_id: UserId,
    pub typing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_with_quotes_separators_or_controls_are_invalid() {
        assert!(is_valid_filename("report final.pdf"));
        assert!(is_valid_filename("фото.png"));
        assert!(!is_valid_filename(""));
        assert!(!is_valid_filename("a\"b.txt"));
        assert!(!is_valid_filename("dir/b.txt"));
        assert!(!is_valid_filename("dir\\b.txt"));
        assert!(!is_valid_filename("bad\r\nname.txt"));
        assert!(!is_valid_filename(&"x".repeat(MAX_FILENAME_BYTES + 1)));
    }

    #[test]
    fn stream_frames_are_tagged_by_kind() {
        let frame = StreamFrame::Event(ServerEvent::MessageDeleted {
            id: MessageId::from("m1"),
        });
        let json = serde_json::to_value(&frame).expect("json");
        assert_eq!(json["frame"], "event");
        assert_eq!(json["data"]["type"], "message_deleted");
        assert_eq!(json["data"]["payload"]["id"], "m1");

        let keepalive = StreamFrame::Keepalive {
            sent_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
        };
        let json = serde_json::to_value(&keepalive).expect("json");
        assert_eq!(json["frame"], "keepalive");
    }
}
