//! Response generation — turns a matched rule's action into an outcome
//! the processor can act on.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::debug;

use crate::ai::{AiProvider, AiRequest, AiTurn, cost_for};
use crate::error::PipelineError;
use crate::event::InboundEvent;
use crate::respond::template;
use crate::rules::model::{ActionConfig, TonePreset};
use crate::store::Database;

/// AI accounting attached to a generated reply.
#[derive(Debug, Clone)]
pub struct AiUsage {
    pub model: String,
    pub tokens: i64,
    pub cost: Option<Decimal>,
}

/// What a rule's action resolved to.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    /// Text to deliver back to the sender.
    Reply {
        text: String,
        ai: Option<AiUsage>,
    },
    /// Storage side effect, nothing outbound.
    SaveLead { tags: Vec<String> },
    /// Storage side effect, nothing outbound.
    TagUser { tags: Vec<String> },
    /// External webhook call with its own retry budget.
    CallWebhook {
        url: String,
        method: String,
        headers: HashMap<String, String>,
        body: Value,
    },
}

/// Executes action configs.
pub struct ResponseGenerator {
    db: Arc<dyn Database>,
    ai: Arc<dyn AiProvider>,
    history_turns: usize,
    max_tokens: u32,
    temperature: f32,
}

impl ResponseGenerator {
    pub fn new(
        db: Arc<dyn Database>,
        ai: Arc<dyn AiProvider>,
        history_turns: usize,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            db,
            ai,
            history_turns,
            max_tokens,
            temperature,
        }
    }

    /// Resolve an action for an event.
    ///
    /// AI failures surface as errors rather than a degraded reply; the
    /// processor decides whether a configured fallback applies.
    pub async fn generate(
        &self,
        event: &InboundEvent,
        action: &ActionConfig,
    ) -> Result<ResponseOutcome, PipelineError> {
        match action {
            ActionConfig::AiReply {
                business_context,
                tone,
                custom_instructions,
            } => {
                self.ai_reply(event, business_context, *tone, custom_instructions.as_deref())
                    .await
            }
            ActionConfig::PredefinedMessage {
                template: tpl,
                variables,
            } => {
                let mut bindings = builtin_variables(event);
                bindings.extend(variables.clone());
                Ok(ResponseOutcome::Reply {
                    text: template::render(tpl, &bindings),
                    ai: None,
                })
            }
            ActionConfig::SaveLead { tags } => Ok(ResponseOutcome::SaveLead { tags: tags.clone() }),
            ActionConfig::TagUser { tags } => Ok(ResponseOutcome::TagUser { tags: tags.clone() }),
            ActionConfig::Webhook {
                url,
                method,
                headers,
            } => Ok(ResponseOutcome::CallWebhook {
                url: url.clone(),
                method: method.clone(),
                headers: headers.clone(),
                body: webhook_body(event),
            }),
        }
    }

    async fn ai_reply(
        &self,
        event: &InboundEvent,
        business_context: &str,
        tone: TonePreset,
        custom_instructions: Option<&str>,
    ) -> Result<ResponseOutcome, PipelineError> {
        // The inbound message is already in the conversation, so the
        // history window ends with the turn to answer.
        let history = self
            .db
            .list_conversation_messages(&event.account_id, &event.sender_id, self.history_turns)
            .await?
            .into_iter()
            .map(|m| AiTurn {
                role: m.role,
                content: m.content,
            })
            .collect::<Vec<_>>();

        let history = if history.is_empty() {
            vec![AiTurn {
                role: "user".into(),
                content: event.text_or_empty().to_string(),
            }]
        } else {
            history
        };

        let request = AiRequest {
            system_prompt: build_system_prompt(business_context, tone, custom_instructions),
            history,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let reply = self.ai.generate(request).await?;
        debug!(
            model = %reply.model,
            tokens = reply.total_tokens(),
            "AI reply generated"
        );

        let usage = AiUsage {
            cost: cost_for(&reply.model, reply.input_tokens, reply.output_tokens),
            tokens: reply.total_tokens(),
            model: reply.model,
        };
        Ok(ResponseOutcome::Reply {
            text: reply.text,
            ai: Some(usage),
        })
    }
}

fn build_system_prompt(
    business_context: &str,
    tone: TonePreset,
    custom_instructions: Option<&str>,
) -> String {
    let mut prompt = format!(
        "You are a direct-message assistant for the following business:\n{business_context}\n\n{}",
        tone.instruction()
    );
    if let Some(extra) = custom_instructions {
        prompt.push_str("\n\nAdditional instructions:\n");
        prompt.push_str(extra);
    }
    prompt.push_str(
        "\n\nKeep replies short enough for a direct message. \
         Never invent prices, stock levels, or order details.",
    );
    prompt
}

fn builtin_variables(event: &InboundEvent) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    if let Some(handle) = &event.sender_handle {
        vars.insert("username".to_string(), handle.clone());
        vars.insert("name".to_string(), handle.clone());
    }
    vars
}

fn webhook_body(event: &InboundEvent) -> Value {
    json!({
        "account_id": event.account_id,
        "sender_id": event.sender_id,
        "sender_handle": event.sender_handle,
        "event_id": event.event_id,
        "kind": event.kind.as_str(),
        "text": event.text,
        "received_at": event.received_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiReply;
    use crate::error::AiError;
    use crate::event::EventKind;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct MockAi {
        reply: Mutex<Option<Result<AiReply, AiError>>>,
        seen_system_prompt: Mutex<Option<String>>,
        seen_history: Mutex<Vec<AiTurn>>,
    }

    impl MockAi {
        fn replying(text: &str) -> Self {
            Self {
                reply: Mutex::new(Some(Ok(AiReply {
                    text: text.to_string(),
                    input_tokens: 100,
                    output_tokens: 20,
                    model: "claude-3-5-haiku-latest".into(),
                }))),
                seen_system_prompt: Mutex::new(None),
                seen_history: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: AiError) -> Self {
            Self {
                reply: Mutex::new(Some(Err(err))),
                seen_system_prompt: Mutex::new(None),
                seen_history: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AiProvider for MockAi {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn generate(&self, request: AiRequest) -> Result<AiReply, AiError> {
            *self.seen_system_prompt.lock().unwrap() = Some(request.system_prompt.clone());
            *self.seen_history.lock().unwrap() = request.history.clone();
            self.reply.lock().unwrap().take().unwrap()
        }
    }

    fn event(text: &str) -> InboundEvent {
        InboundEvent {
            event_id: "e1".into(),
            account_id: "acct".into(),
            sender_id: "u1".into(),
            sender_handle: Some("ana".into()),
            text: Some(text.into()),
            attachments: vec![],
            kind: EventKind::Message,
            received_at: Utc::now(),
        }
    }

    async fn generator(ai: Arc<dyn AiProvider>) -> (ResponseGenerator, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (ResponseGenerator::new(db.clone(), ai, 10, 512, 0.7), db)
    }

    #[tokio::test]
    async fn ai_reply_carries_usage_and_cost() {
        let ai = Arc::new(MockAi::replying("Hey! We open at 9am."));
        let (generator, _) = generator(ai.clone()).await;
        let action = ActionConfig::AiReply {
            business_context: "A coffee shop in Lisbon".into(),
            tone: TonePreset::Friendly,
            custom_instructions: None,
        };

        let outcome = generator.generate(&event("when do you open?"), &action).await.unwrap();
        match outcome {
            ResponseOutcome::Reply { text, ai: Some(usage) } => {
                assert_eq!(text, "Hey! We open at 9am.");
                assert_eq!(usage.tokens, 120);
                assert!(usage.cost.is_some());
            }
            other => panic!("Expected AI reply, got {:?}", other),
        }

        let prompt = ai.seen_system_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("A coffee shop in Lisbon"));
        assert!(prompt.contains("friendly"));
    }

    #[tokio::test]
    async fn custom_instructions_land_in_the_prompt() {
        let ai = Arc::new(MockAi::replying("ok"));
        let (generator, _) = generator(ai.clone()).await;
        let action = ActionConfig::AiReply {
            business_context: "ctx".into(),
            tone: TonePreset::Formal,
            custom_instructions: Some("Always mention the loyalty program.".into()),
        };
        generator.generate(&event("hi"), &action).await.unwrap();

        let prompt = ai.seen_system_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Always mention the loyalty program."));
    }

    #[tokio::test]
    async fn history_window_feeds_the_request() {
        let ai = Arc::new(MockAi::replying("ok"));
        let (generator, db) = generator(ai.clone()).await;
        let now = Utc::now();
        db.append_conversation_message("acct", "u1", "user", "hi", now, None).await.unwrap();
        db.append_conversation_message("acct", "u1", "assistant", "hello!", now, None).await.unwrap();
        db.append_conversation_message("acct", "u1", "user", "do you ship?", now, None).await.unwrap();

        let action = ActionConfig::AiReply {
            business_context: "ctx".into(),
            tone: TonePreset::Friendly,
            custom_instructions: None,
        };
        generator.generate(&event("do you ship?"), &action).await.unwrap();

        let history = ai.seen_history.lock().unwrap().clone();
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().content, "do you ship?");
    }

    #[tokio::test]
    async fn ai_failure_propagates_instead_of_degrading() {
        let ai = Arc::new(MockAi::failing(AiError::RequestFailed {
            provider: "mock".into(),
            reason: "boom".into(),
        }));
        let (generator, _) = generator(ai).await;
        let action = ActionConfig::AiReply {
            business_context: "ctx".into(),
            tone: TonePreset::Friendly,
            custom_instructions: None,
        };
        let result = generator.generate(&event("hi"), &action).await;
        assert!(matches!(result, Err(PipelineError::Ai(_))));
    }

    #[tokio::test]
    async fn predefined_message_renders_with_builtins() {
        let ai = Arc::new(MockAi::replying("unused"));
        let (generator, _) = generator(ai).await;
        let action = ActionConfig::PredefinedMessage {
            template: "Hi {{name}}! Use code {{code}}".into(),
            variables: HashMap::from([("code".to_string(), "WELCOME10".to_string())]),
        };
        let outcome = generator.generate(&event("hi"), &action).await.unwrap();
        match outcome {
            ResponseOutcome::Reply { text, ai: None } => {
                assert_eq!(text, "Hi ana! Use code WELCOME10");
            }
            other => panic!("Expected template reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn webhook_action_builds_event_payload() {
        let ai = Arc::new(MockAi::replying("unused"));
        let (generator, _) = generator(ai).await;
        let action = ActionConfig::Webhook {
            url: "https://hooks.example/lead".into(),
            method: "POST".into(),
            headers: HashMap::new(),
        };
        let outcome = generator.generate(&event("interested!"), &action).await.unwrap();
        match outcome {
            ResponseOutcome::CallWebhook { url, body, .. } => {
                assert_eq!(url, "https://hooks.example/lead");
                assert_eq!(body["sender_id"], "u1");
                assert_eq!(body["text"], "interested!");
            }
            other => panic!("Expected webhook call, got {:?}", other),
        }
    }
}
