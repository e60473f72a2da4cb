//! Activity recording — one log row per pipeline attempt.
//!
//! The recorder is a pure observer. It must never block the pipeline's
//! critical path on its own failure: recording errors are logged and
//! swallowed, not propagated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::event::InboundEvent;
use crate::store::Database;

/// Lifecycle status of one pipeline attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Created when the event enters rule evaluation.
    Pending,
    /// Outbound action resolved (or side effect committed).
    Success,
    /// Retries exhausted or permanent rejection.
    Failed,
    /// No rule matched; no outbound action.
    Skipped,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    /// Terminal states are never updated again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One record per pipeline attempt.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub id: Uuid,
    pub account_id: String,
    pub sender_id: String,
    pub event_id: String,
    pub automation_id: Option<Uuid>,
    pub incoming_message: String,
    pub outgoing_response: Option<String>,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub ai_model: Option<String>,
    pub ai_tokens_used: Option<i64>,
    pub ai_cost: Option<Decimal>,
    pub sentiment: Option<String>,
    pub platform_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Terminal fields applied when an attempt resolves.
#[derive(Debug, Clone, Default)]
pub struct ActivityUpdate {
    pub status: Option<ActivityStatus>,
    pub automation_id: Option<Uuid>,
    pub outgoing_response: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub ai_model: Option<String>,
    pub ai_tokens_used: Option<i64>,
    pub ai_cost: Option<Decimal>,
    pub sentiment: Option<String>,
    pub platform_message_id: Option<String>,
}

/// Observer that records pipeline attempts without ever failing them.
pub struct ActivityRecorder {
    db: Arc<dyn Database>,
}

impl ActivityRecorder {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Open a pending row as the event enters rule evaluation.
    ///
    /// Returns `None` if the row could not be written; the pipeline
    /// continues either way.
    pub async fn begin(&self, event: &InboundEvent) -> Option<Uuid> {
        let log = ActivityLog {
            id: Uuid::new_v4(),
            account_id: event.account_id.clone(),
            sender_id: event.sender_id.clone(),
            event_id: event.event_id.clone(),
            automation_id: None,
            incoming_message: event.text_or_empty().to_string(),
            outgoing_response: None,
            status: ActivityStatus::Pending,
            error_message: None,
            processing_time_ms: None,
            ai_model: None,
            ai_tokens_used: None,
            ai_cost: None,
            sentiment: None,
            platform_message_id: None,
            created_at: Utc::now(),
        };
        match self.db.insert_activity(&log).await {
            Ok(()) => Some(log.id),
            Err(e) => {
                warn!(error = %e, event_id = %event.event_id, "Failed to open activity row");
                None
            }
        }
    }

    /// Reuse the pending row left by an earlier attempt on the same
    /// event, or open a fresh one. A retried job must not pile up one
    /// pending row per attempt.
    pub async fn begin_or_resume(&self, event: &InboundEvent) -> Option<Uuid> {
        match self
            .db
            .find_pending_activity(&event.account_id, &event.event_id)
            .await
        {
            Ok(Some(id)) => Some(id),
            Ok(None) => self.begin(event).await,
            Err(e) => {
                warn!(error = %e, event_id = %event.event_id, "Failed to look up activity row");
                self.begin(event).await
            }
        }
    }

    /// Apply a terminal (or enrichment) update to an attempt.
    pub async fn update(&self, id: Option<Uuid>, update: ActivityUpdate) {
        let Some(id) = id else { return };
        if let Err(e) = self.db.update_activity(id, &update).await {
            warn!(error = %e, activity_id = %id, "Failed to update activity row");
        }
    }

    /// Mark an attempt skipped (no rule matched).
    pub async fn skip(&self, id: Option<Uuid>, elapsed_ms: i64) {
        self.update(
            id,
            ActivityUpdate {
                status: Some(ActivityStatus::Skipped),
                processing_time_ms: Some(elapsed_ms),
                ..Default::default()
            },
        )
        .await;
    }

    /// Mark an attempt failed with a reason.
    pub async fn fail(&self, id: Option<Uuid>, error: String, elapsed_ms: i64) {
        self.update(
            id,
            ActivityUpdate {
                status: Some(ActivityStatus::Failed),
                error_message: Some(error),
                processing_time_ms: Some(elapsed_ms),
                ..Default::default()
            },
        )
        .await;
    }

    /// Current status of an attempt, if readable. Used by the send worker
    /// to skip jobs whose outcome is already terminal.
    pub async fn status(&self, id: Uuid) -> Option<ActivityStatus> {
        match self.db.get_activity(id).await {
            Ok(Some(log)) => Some(log.status),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, activity_id = %id, "Failed to read activity row");
                None
            }
        }
    }
}
