//! Automation rule model.
//!
//! Trigger and action are each a serde-tagged sum type: the condition
//! shape is selected by the trigger type and the config shape by the
//! action type, so an invalid pairing is unrepresentable rather than
//! validated at runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a keyword is compared against message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordMatchType {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Regex,
}

/// Tone preset for AI replies. Unknown tones fall back to `Friendly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TonePreset {
    Professional,
    Casual,
    Enthusiastic,
    Formal,
    // serde requires the catch-all variant to come last
    #[default]
    #[serde(other)]
    Friendly,
}

impl TonePreset {
    /// Canned system-prompt instruction for this tone.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Professional => {
                "Respond in a professional, courteous tone. Stay concise and factual."
            }
            Self::Friendly => {
                "Respond in a warm, friendly tone, like a helpful member of the team."
            }
            Self::Casual => "Respond casually and conversationally. Contractions are fine.",
            Self::Enthusiastic => {
                "Respond with energy and enthusiasm. Show genuine excitement to help."
            }
            Self::Formal => "Respond formally and respectfully. No slang or contractions.",
        }
    }
}

/// Trigger condition — the shape is fixed by the trigger type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "trigger_type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Matches message text against a keyword list.
    Keyword {
        keywords: Vec<String>,
        match_type: KeywordMatchType,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Matches the first inbound message of a conversation.
    FirstMessage,
    /// Matches reaction events.
    Reaction,
    /// Matches story-reply events.
    StoryReply,
    /// Matches comment events.
    Comment,
}

impl TriggerCondition {
    /// Short label for logging and activity rows.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "keyword",
            Self::FirstMessage => "first_message",
            Self::Reaction => "reaction",
            Self::StoryReply => "story_reply",
            Self::Comment => "comment",
        }
    }
}

/// Action configuration — the shape is fixed by the action type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionConfig {
    /// Generate a reply with the AI provider.
    AiReply {
        /// Business description injected into the system prompt.
        business_context: String,
        #[serde(default)]
        tone: TonePreset,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_instructions: Option<String>,
    },
    /// Send a canned message with `{{variable}}` substitution.
    PredefinedMessage {
        template: String,
        #[serde(default)]
        variables: HashMap<String, String>,
    },
    /// Record the sender as a lead. Storage side effect, no outbound message.
    SaveLead {
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Attach tags to the sender. Storage side effect, no outbound message.
    TagUser { tags: Vec<String> },
    /// Call an external webhook with its own retry budget.
    Webhook {
        url: String,
        #[serde(default = "default_webhook_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

impl ActionConfig {
    /// Short label for logging and activity rows.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AiReply { .. } => "ai_reply",
            Self::PredefinedMessage { .. } => "predefined_message",
            Self::SaveLead { .. } => "save_lead",
            Self::TagUser { .. } => "tag_user",
            Self::Webhook { .. } => "webhook",
        }
    }
}

/// A user-configured trigger → action mapping. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub is_active: bool,
    pub trigger: TriggerCondition,
    pub action: ActionConfig,
    /// Explicit evaluation order; lower evaluates first.
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_condition_serializes_tagged() {
        let trigger = TriggerCondition::Keyword {
            keywords: vec!["price".into()],
            match_type: KeywordMatchType::Contains,
            case_sensitive: false,
        };
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["trigger_type"], "keyword");
        assert_eq!(json["match_type"], "contains");
    }

    #[test]
    fn action_config_round_trips() {
        let action = ActionConfig::Webhook {
            url: "https://hooks.example.com/lead".into(),
            method: "POST".into(),
            headers: HashMap::new(),
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: ActionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label(), "webhook");
    }

    #[test]
    fn webhook_method_defaults_to_post() {
        let action: ActionConfig = serde_json::from_str(
            r#"{"action_type": "webhook", "url": "https://x.example/hook"}"#,
        )
        .unwrap();
        match action {
            ActionConfig::Webhook { method, .. } => assert_eq!(method, "POST"),
            other => panic!("Expected Webhook, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tone_falls_back_to_friendly() {
        let tone: TonePreset = serde_json::from_str(r#""sassy""#).unwrap();
        assert_eq!(tone, TonePreset::Friendly);

        let tone: TonePreset = serde_json::from_str(r#""formal""#).unwrap();
        assert_eq!(tone, TonePreset::Formal);
    }

    #[test]
    fn invalid_pairing_is_unrepresentable() {
        // A keyword payload under a first_message tag simply ignores the
        // extra fields — there is no way to build a FirstMessage trigger
        // that carries keyword config.
        let trigger: TriggerCondition =
            serde_json::from_str(r#"{"trigger_type": "first_message"}"#).unwrap();
        assert!(matches!(trigger, TriggerCondition::FirstMessage));
    }
}
