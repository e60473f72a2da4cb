//! Webhook envelope model and event extraction.
//!
//! The platform batches notifications: one POST body carries an `entry`
//! array, each entry carries `messaging` items (DMs, reactions, story
//! replies) and `changes` items (comments). Extraction is tolerant of
//! unknown fields but strict about the envelope frame itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::{AttachmentRef, EventKind, InboundEvent};

/// Top-level webhook POST body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<EnvelopeEntry>,
}

/// One batched notification for a single connected account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeEntry {
    /// Connected business account id.
    pub id: String,
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub messaging: Vec<MessagingItem>,
    #[serde(default)]
    pub changes: Vec<ChangeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingItem {
    pub sender: Participant,
    pub recipient: Participant,
    /// Event time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    pub message: Option<MessagePayload>,
    pub reaction: Option<ReactionPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub mid: String,
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Echoes are our own outbound messages reflected back.
    #[serde(default)]
    pub is_echo: bool,
    pub reply_to: Option<ReplyTo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: AttachmentPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyTo {
    pub story: Option<StoryRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryRef {
    pub id: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// Message the reaction applies to.
    pub mid: String,
    /// "react" or "unreact".
    pub action: String,
    pub reaction: Option<String>,
    pub emoji: Option<String>,
}

/// A `changes` item. Only comment notifications are extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeItem {
    pub field: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Parse the raw POST body into an envelope.
pub fn parse_envelope(raw: &[u8]) -> Result<WebhookEnvelope, ValidationError> {
    let envelope: WebhookEnvelope = serde_json::from_slice(raw)
        .map_err(|e| ValidationError::Envelope(e.to_string()))?;
    if envelope.object != "instagram" {
        return Err(ValidationError::Envelope(format!(
            "unexpected object type '{}'",
            envelope.object
        )));
    }
    Ok(envelope)
}

/// Extract the inbound events from one entry.
///
/// Echoes, unreact notifications, and items with no usable payload are
/// dropped here; they never reach the queue.
pub fn events_from_entry(entry: &EnvelopeEntry) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    for item in &entry.messaging {
        if let Some(event) = event_from_messaging(&entry.id, item) {
            events.push(event);
        }
    }

    for change in &entry.changes {
        if change.field == "comments"
            && let Some(event) = event_from_comment(&entry.id, &change.value)
        {
            events.push(event);
        }
    }

    events
}

fn event_from_messaging(account_id: &str, item: &MessagingItem) -> Option<InboundEvent> {
    let received_at = epoch_millis(item.timestamp);

    if let Some(reaction) = &item.reaction {
        if reaction.action != "react" {
            return None;
        }
        return Some(InboundEvent {
            // Reactions share the target message's mid; suffix keeps the
            // dedup key distinct from the message itself.
            event_id: format!("{}:reaction", reaction.mid),
            account_id: account_id.to_string(),
            sender_id: item.sender.id.clone(),
            sender_handle: item.sender.username.clone(),
            text: reaction.emoji.clone().or_else(|| reaction.reaction.clone()),
            attachments: Vec::new(),
            kind: EventKind::Reaction,
            received_at,
        });
    }

    let message = item.message.as_ref()?;
    if message.is_echo {
        return None;
    }

    let kind = if message.reply_to.as_ref().is_some_and(|r| r.story.is_some()) {
        EventKind::StoryReply
    } else {
        EventKind::Message
    };

    let attachments = message
        .attachments
        .iter()
        .filter_map(|a| {
            a.payload.url.as_ref().map(|url| AttachmentRef {
                kind: a.kind.clone(),
                url: url.clone(),
            })
        })
        .collect::<Vec<_>>();

    if message.text.is_none() && attachments.is_empty() && kind == EventKind::Message {
        return None;
    }

    Some(InboundEvent {
        event_id: message.mid.clone(),
        account_id: account_id.to_string(),
        sender_id: item.sender.id.clone(),
        sender_handle: item.sender.username.clone(),
        text: message.text.clone(),
        attachments,
        kind,
        received_at,
    })
}

fn event_from_comment(account_id: &str, value: &serde_json::Value) -> Option<InboundEvent> {
    let comment_id = value.get("id")?.as_str()?;
    let from = value.get("from")?;
    let sender_id = from.get("id")?.as_str()?;
    Some(InboundEvent {
        event_id: comment_id.to_string(),
        account_id: account_id.to_string(),
        sender_id: sender_id.to_string(),
        sender_handle: from
            .get("username")
            .and_then(|u| u.as_str())
            .map(str::to_string),
        text: value
            .get("text")
            .and_then(|t| t.as_str())
            .map(str::to_string),
        attachments: Vec::new(),
        kind: EventKind::Comment,
        received_at: Utc::now(),
    })
}

fn epoch_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_with(messaging: serde_json::Value) -> WebhookEnvelope {
        let raw = json!({
            "object": "instagram",
            "entry": [{
                "id": "acct_17",
                "time": 1_700_000_000,
                "messaging": [messaging]
            }]
        });
        parse_envelope(raw.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn extracts_text_message() {
        let envelope = envelope_with(json!({
            "sender": {"id": "u1", "username": "ana"},
            "recipient": {"id": "acct_17"},
            "timestamp": 1_700_000_000_123i64,
            "message": {"mid": "m.1", "text": "hello"}
        }));
        let events = events_from_entry(&envelope.entry[0]);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_id, "m.1");
        assert_eq!(event.account_id, "acct_17");
        assert_eq!(event.sender_handle.as_deref(), Some("ana"));
        assert_eq!(event.text.as_deref(), Some("hello"));
        assert_eq!(event.kind, EventKind::Message);
    }

    #[test]
    fn drops_echoes() {
        let envelope = envelope_with(json!({
            "sender": {"id": "acct_17"},
            "recipient": {"id": "u1"},
            "timestamp": 0,
            "message": {"mid": "m.2", "text": "our own reply", "is_echo": true}
        }));
        assert!(events_from_entry(&envelope.entry[0]).is_empty());
    }

    #[test]
    fn reaction_gets_suffixed_event_id() {
        let envelope = envelope_with(json!({
            "sender": {"id": "u1"},
            "recipient": {"id": "acct_17"},
            "timestamp": 0,
            "reaction": {"mid": "m.3", "action": "react", "emoji": "❤️"}
        }));
        let events = events_from_entry(&envelope.entry[0]);
        assert_eq!(events[0].event_id, "m.3:reaction");
        assert_eq!(events[0].kind, EventKind::Reaction);
        assert_eq!(events[0].text.as_deref(), Some("❤️"));
    }

    #[test]
    fn unreact_is_dropped() {
        let envelope = envelope_with(json!({
            "sender": {"id": "u1"},
            "recipient": {"id": "acct_17"},
            "timestamp": 0,
            "reaction": {"mid": "m.4", "action": "unreact"}
        }));
        assert!(events_from_entry(&envelope.entry[0]).is_empty());
    }

    #[test]
    fn story_reply_is_detected() {
        let envelope = envelope_with(json!({
            "sender": {"id": "u1"},
            "recipient": {"id": "acct_17"},
            "timestamp": 0,
            "message": {
                "mid": "m.5",
                "text": "love this!",
                "reply_to": {"story": {"id": "story_9", "url": "https://cdn.example/story_9"}}
            }
        }));
        let events = events_from_entry(&envelope.entry[0]);
        assert_eq!(events[0].kind, EventKind::StoryReply);
    }

    #[test]
    fn media_only_message_keeps_attachments() {
        let envelope = envelope_with(json!({
            "sender": {"id": "u1"},
            "recipient": {"id": "acct_17"},
            "timestamp": 0,
            "message": {
                "mid": "m.6",
                "attachments": [{"type": "image", "payload": {"url": "https://cdn.example/pic.jpg"}}]
            }
        }));
        let events = events_from_entry(&envelope.entry[0]);
        assert_eq!(events.len(), 1);
        assert!(events[0].text.is_none());
        assert_eq!(events[0].attachments[0].kind, "image");
    }

    #[test]
    fn comment_change_becomes_event() {
        let raw = json!({
            "object": "instagram",
            "entry": [{
                "id": "acct_17",
                "time": 0,
                "changes": [{
                    "field": "comments",
                    "value": {
                        "id": "c.1",
                        "from": {"id": "u2", "username": "bo"},
                        "text": "price?"
                    }
                }]
            }]
        });
        let envelope = parse_envelope(raw.to_string().as_bytes()).unwrap();
        let events = events_from_entry(&envelope.entry[0]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Comment);
        assert_eq!(events[0].event_id, "c.1");
        assert_eq!(events[0].text.as_deref(), Some("price?"));
    }

    #[test]
    fn rejects_wrong_object() {
        let raw = json!({"object": "page", "entry": []});
        assert!(parse_envelope(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(parse_envelope(b"{not json").is_err());
    }
}
