//! Inbound event model.
//!
//! One `InboundEvent` is one message-received notification from the
//! messaging platform. Events are immutable once stored and deduplicated
//! per `(account_id, event_id)` — the platform only guarantees event id
//! uniqueness within a single account's stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform event sub-type. Trigger conditions for reactions, story
/// replies and comments match against this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    Reaction,
    StoryReply,
    Comment,
}

impl EventKind {
    /// Short label for logging and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
            Self::StoryReply => "story_reply",
            Self::Comment => "comment",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "reaction" => Self::Reaction,
            "story_reply" => Self::StoryReply,
            "comment" => Self::Comment,
            _ => Self::Message,
        }
    }
}

/// Reference to a media attachment on an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment type as reported by the platform ("image", "video", …).
    pub kind: String,
    /// Platform-hosted URL of the attachment payload.
    pub url: String,
}

/// One raw message-received notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform-assigned id, the deduplication key within an account.
    pub event_id: String,
    /// Connected business account that received the event.
    pub account_id: String,
    /// External sender id.
    pub sender_id: String,
    /// Sender handle, when the platform includes it.
    pub sender_handle: Option<String>,
    /// Message text. Reactions and media-only messages may have none.
    pub text: Option<String>,
    pub attachments: Vec<AttachmentRef>,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Text content, or empty for text-less events.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    /// Conversation key for ordering and locking.
    pub fn conversation_key(&self) -> (String, String) {
        (self.account_id.clone(), self.sender_id.clone())
    }
}
