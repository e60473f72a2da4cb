//! `Database` trait — single async interface for all persistence.
//!
//! The pipeline depends only on this trait; the storage technology behind
//! it is an external collaborator choice. The libsql backend is the
//! shipped implementation, with `:memory:` used throughout the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::activity::{ActivityLog, ActivityUpdate};
use crate::error::DatabaseError;
use crate::event::InboundEvent;
use crate::queue::{JobKind, JobStatus, QueueJob};
use crate::rules::model::AutomationRule;

/// One message in a conversation's history.
#[derive(Debug, Clone)]
pub struct ConversationMessage {
    /// "user" for inbound, "assistant" for our replies.
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Metadata for one conversation thread.
#[derive(Debug, Clone)]
pub struct ConversationMeta {
    pub account_id: String,
    pub sender_id: String,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Inbound events ──────────────────────────────────────────────

    /// Persist an event and enqueue its processing job in one transaction.
    ///
    /// Keyed on `(account_id, event_id)`: returns `false` without side
    /// effects when the event was already seen, so webhook redelivery is
    /// a no-op. Returns `true` when the event and job were written.
    async fn ingest_event(
        &self,
        event: &InboundEvent,
        job_kind: JobKind,
        job_payload: &Value,
        job_max_attempts: u32,
    ) -> Result<bool, DatabaseError>;

    /// Look up a stored event.
    async fn get_event(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<Option<InboundEvent>, DatabaseError>;

    /// Delete events older than `keep_days` (archival is out of scope).
    /// Returns the number of rows removed.
    async fn prune_events(&self, keep_days: u32) -> Result<usize, DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Append a message, creating the conversation on first write.
    ///
    /// When `event_id` is given the append is idempotent on
    /// `(account_id, sender_id, event_id)`: a message already recorded
    /// for that event is left untouched and `false` is returned. Returns
    /// `true` when the message was inserted.
    async fn append_conversation_message(
        &self,
        account_id: &str,
        sender_id: &str,
        role: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Number of inbound ("user") messages in a conversation.
    async fn count_inbound_messages(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<usize, DatabaseError>;

    /// Most recent messages in timestamp order (oldest of the window
    /// first), regardless of insert order.
    async fn list_conversation_messages(
        &self,
        account_id: &str,
        sender_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;

    /// Conversation metadata, if the thread exists.
    async fn get_conversation(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<Option<ConversationMeta>, DatabaseError>;

    // ── Automation rules ────────────────────────────────────────────

    /// Active rules for an account (unsorted; the matcher orders them).
    async fn find_active_rules(
        &self,
        account_id: &str,
    ) -> Result<Vec<AutomationRule>, DatabaseError>;

    /// Insert or replace a rule. Rule editing belongs to the dashboard;
    /// the pipeline uses this for seeding and tests.
    async fn upsert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError>;

    // ── Leads / tags ────────────────────────────────────────────────

    /// Record a sender as a lead, merging tags on conflict.
    async fn save_lead(
        &self,
        account_id: &str,
        sender_id: &str,
        sender_handle: Option<&str>,
        tags: &[String],
    ) -> Result<(), DatabaseError>;

    /// Attach tags to a sender, creating the lead row if needed.
    async fn tag_user(
        &self,
        account_id: &str,
        sender_id: &str,
        tags: &[String],
    ) -> Result<(), DatabaseError>;

    /// Tags currently attached to a sender.
    async fn get_user_tags(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<Vec<String>, DatabaseError>;

    // ── Activity log ────────────────────────────────────────────────

    async fn insert_activity(&self, log: &ActivityLog) -> Result<(), DatabaseError>;

    async fn update_activity(
        &self,
        id: Uuid,
        update: &ActivityUpdate,
    ) -> Result<(), DatabaseError>;

    async fn get_activity(&self, id: Uuid) -> Result<Option<ActivityLog>, DatabaseError>;

    /// Id of the unresolved (pending) activity row for an event, if one
    /// exists. Lets a retried attempt pick up where the last one stopped
    /// instead of opening a second row.
    async fn find_pending_activity(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<Option<Uuid>, DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        kind: JobKind,
        payload: &Value,
        max_attempts: u32,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError>;

    /// Atomically claim the next visible job of a kind: bump its attempt
    /// counter, mark it in flight, and push `visible_at` to `reclaim_at`.
    async fn claim_job(
        &self,
        kind: JobKind,
        reclaim_at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, DatabaseError>;

    /// Mark a job done.
    async fn finish_job(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Return a job to `pending`, visible again at `visible_at`.
    async fn release_job(
        &self,
        id: Uuid,
        error: &str,
        visible_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Move a job to the dead-letter state.
    async fn dead_letter_job(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>, DatabaseError>;

    /// Count jobs of a kind in a given status (monitoring and tests).
    async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<usize, DatabaseError>;
}
