//! Message processor — the per-event pipeline stage.
//!
//! One processing job carries one stored event. The stage runs under a
//! per-conversation lock so two messages from the same sender can never
//! interleave their history reads and writes. Side-effect actions commit
//! here; text replies are handed to the send queue and resolve there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::activity::{ActivityRecorder, ActivityStatus, ActivityUpdate};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::event::InboundEvent;
use crate::queue::{JobKind, JobQueue, QueueJob};
use crate::respond::{ResponseGenerator, ResponseOutcome, sentiment};
use crate::rules::RuleMatcher;
use crate::send::WebhookCaller;
use crate::store::Database;

/// Per-conversation async locks.
///
/// The map only grows for conversations seen this process lifetime;
/// entries are tiny and the set of active senders is bounded in practice.
#[derive(Default, Clone)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: (String, String)) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

pub struct MessageProcessor {
    db: Arc<dyn Database>,
    matcher: RuleMatcher,
    generator: ResponseGenerator,
    queue: JobQueue,
    recorder: ActivityRecorder,
    webhook_caller: WebhookCaller,
    locks: ConversationLocks,
    config: PipelineConfig,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<dyn Database>,
        matcher: RuleMatcher,
        generator: ResponseGenerator,
        queue: JobQueue,
        recorder: ActivityRecorder,
        webhook_caller: WebhookCaller,
        locks: ConversationLocks,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            matcher,
            generator,
            queue,
            recorder,
            webhook_caller,
            locks,
            config,
        }
    }

    /// Handle one processing job.
    pub async fn handle_job(&self, job: &QueueJob) -> Result<(), PipelineError> {
        let account_id = job.payload["account_id"].as_str().unwrap_or_default();
        let event_id = job.payload["event_id"].as_str().unwrap_or_default();

        let Some(event) = self.db.get_event(account_id, event_id).await? else {
            // Should be unreachable: the event and this job are written in
            // one transaction. Acking avoids a retry loop that cannot heal.
            warn!(account_id, event_id, "Processing job references no stored event");
            return Ok(());
        };

        self.process(&event).await
    }

    /// Run the pipeline for one event. Safe to rerun for the same event:
    /// the conversation append is keyed on the event id and the activity
    /// row from an earlier attempt is resumed, not duplicated.
    pub async fn process(&self, event: &InboundEvent) -> Result<(), PipelineError> {
        let started = Instant::now();
        let _guard = self.locks.acquire(event.conversation_key()).await;

        // Prior count is read before this event joins the history, so a
        // first_message trigger sees zero. When a retry finds the message
        // already appended it must not count against itself.
        let mut prior_messages = self
            .db
            .count_inbound_messages(&event.account_id, &event.sender_id)
            .await?;
        if let Some(text) = &event.text {
            let appended = self
                .db
                .append_conversation_message(
                    &event.account_id,
                    &event.sender_id,
                    "user",
                    text,
                    event.received_at,
                    Some(&event.event_id),
                )
                .await
                .map_err(|e| PipelineError::Conversation(e.to_string()))?;
            if !appended {
                prior_messages = prior_messages.saturating_sub(1);
            }
        }

        let activity_id = self.recorder.begin_or_resume(event).await;

        let Some(rule) = self.matcher.select(event, prior_messages).await? else {
            self.recorder.skip(activity_id, elapsed_ms(started)).await;
            return Ok(());
        };

        let event_sentiment = event
            .text
            .as_deref()
            .map(|t| sentiment::classify(t).to_string());

        let outcome = match self.generator.generate(event, &rule.action).await {
            Ok(outcome) => outcome,
            Err(e @ PipelineError::Ai(_)) => {
                if let Some(fallback) = self.config.fallback_reply.clone() {
                    warn!(rule_id = %rule.id, error = %e, "AI generation failed, using fallback reply");
                    ResponseOutcome::Reply {
                        text: fallback,
                        ai: None,
                    }
                } else if e.is_retryable() {
                    // Requeue; the activity row stays pending and the next
                    // attempt updates it.
                    return Err(e);
                } else {
                    self.recorder
                        .fail(activity_id, e.to_string(), elapsed_ms(started))
                        .await;
                    return Err(e);
                }
            }
            Err(e) => {
                self.recorder
                    .fail(activity_id, e.to_string(), elapsed_ms(started))
                    .await;
                return Err(e);
            }
        };

        match outcome {
            ResponseOutcome::Reply { text, ai } => {
                let payload = json!({
                    "account_id": event.account_id,
                    "recipient_id": event.sender_id,
                    "text": &text,
                    "activity_id": activity_id,
                });
                self.recorder
                    .update(
                        activity_id,
                        ActivityUpdate {
                            automation_id: Some(rule.id),
                            outgoing_response: Some(text.clone()),
                            sentiment: event_sentiment,
                            processing_time_ms: Some(elapsed_ms(started)),
                            ai_model: ai.as_ref().map(|u| u.model.clone()),
                            ai_tokens_used: ai.as_ref().map(|u| u.tokens),
                            ai_cost: ai.as_ref().and_then(|u| u.cost),
                            ..Default::default()
                        },
                    )
                    .await;
                self.queue
                    .enqueue(
                        JobKind::SendMessage,
                        payload,
                        self.config.send_max_attempts,
                        None,
                    )
                    .await?;
                info!(
                    rule_id = %rule.id,
                    event_id = %event.event_id,
                    "Reply queued for delivery"
                );
            }
            ResponseOutcome::SaveLead { tags } => {
                self.db
                    .save_lead(
                        &event.account_id,
                        &event.sender_id,
                        event.sender_handle.as_deref(),
                        &tags,
                    )
                    .await?;
                self.finish_side_effect(activity_id, rule.id, event_sentiment, started)
                    .await;
                info!(rule_id = %rule.id, sender_id = %event.sender_id, "Lead saved");
            }
            ResponseOutcome::TagUser { tags } => {
                self.db
                    .tag_user(&event.account_id, &event.sender_id, &tags)
                    .await?;
                self.finish_side_effect(activity_id, rule.id, event_sentiment, started)
                    .await;
            }
            ResponseOutcome::CallWebhook {
                url,
                method,
                headers,
                body,
            } => {
                // The caller owns its retry budget; exhaustion here is
                // final for this event.
                match self.webhook_caller.call(&url, &method, &headers, &body).await {
                    Ok(()) => {
                        self.finish_side_effect(activity_id, rule.id, event_sentiment, started)
                            .await;
                        info!(rule_id = %rule.id, url = %url, "Webhook action delivered");
                    }
                    Err(e) => {
                        warn!(rule_id = %rule.id, url = %url, error = %e, "Webhook action failed");
                        self.recorder
                            .update(
                                activity_id,
                                ActivityUpdate {
                                    status: Some(ActivityStatus::Failed),
                                    automation_id: Some(rule.id),
                                    error_message: Some(e.to_string()),
                                    processing_time_ms: Some(elapsed_ms(started)),
                                    ..Default::default()
                                },
                            )
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn finish_side_effect(
        &self,
        activity_id: Option<uuid::Uuid>,
        rule_id: uuid::Uuid,
        event_sentiment: Option<String>,
        started: Instant,
    ) {
        self.recorder
            .update(
                activity_id,
                ActivityUpdate {
                    status: Some(ActivityStatus::Success),
                    automation_id: Some(rule_id),
                    sentiment: event_sentiment,
                    processing_time_ms: Some(elapsed_ms(started)),
                    ..Default::default()
                },
            )
            .await;
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}
