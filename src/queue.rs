//! Durable job queue over the backing store.
//!
//! Jobs move through `pending → in_flight → done`, or to `dead` once
//! their attempt budget is exhausted. A claim carries a visibility
//! timeout: a worker that stalls past it loses the claim and another
//! worker may pick the job up. Payloads are immutable after enqueue —
//! only job status changes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::Database;

/// The three job kinds the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Raw envelope entry from the webhook handler, pre-parse.
    WebhookIntake,
    /// Rule evaluation + response generation for one stored event.
    ProcessMessage,
    /// Outbound delivery of a generated reply.
    SendMessage,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookIntake => "webhook_intake",
            Self::ProcessMessage => "process_message",
            Self::SendMessage => "send_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "webhook_intake" => Some(Self::WebhookIntake),
            "process_message" => Some(Self::ProcessMessage),
            "send_message" => Some(Self::SendMessage),
            _ => None,
        }
    }
}

/// Queue lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InFlight,
    Done,
    /// Retry budget exhausted; held for manual inspection.
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "done" => Self::Done,
            "dead" => Self::Dead,
            _ => Self::Pending,
        }
    }
}

/// One durable queue job.
#[derive(Debug, Clone)]
pub struct QueueJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: Value,
    pub status: JobStatus,
    /// Claims so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be (re)claimed.
    pub visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Queue facade over the store.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
    visibility_timeout: Duration,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            visibility_timeout,
        }
    }

    /// Enqueue a job, optionally delayed.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        max_attempts: u32,
        delay: Option<Duration>,
    ) -> Result<Uuid, QueueError> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay.unwrap_or_default())
                .unwrap_or_else(|_| chrono::Duration::zero());
        let id = self
            .db
            .enqueue_job(kind, &payload, max_attempts, visible_at)
            .await?;
        debug!(job_id = %id, kind = kind.as_str(), "Enqueued job");
        Ok(id)
    }

    /// Claim the next visible job of a kind, if any.
    ///
    /// The claim increments the attempt counter and pushes `visible_at`
    /// past the visibility timeout, so a stalled worker's claim lapses.
    pub async fn dequeue(&self, kind: JobKind) -> Result<Option<QueueJob>, QueueError> {
        let reclaim_at = Utc::now()
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let job = self.db.claim_job(kind, reclaim_at).await?;
        if let Some(ref job) = job {
            debug!(
                job_id = %job.id,
                kind = kind.as_str(),
                attempt = job.attempts,
                "Claimed job"
            );
        }
        Ok(job)
    }

    /// Mark a job complete.
    pub async fn ack(&self, job: &QueueJob) -> Result<(), QueueError> {
        self.db.finish_job(job.id).await?;
        Ok(())
    }

    /// Return a job to the queue after a failure.
    ///
    /// Requeues with the given delay while budget remains; dead-letters
    /// once `attempts >= max_attempts`. Never drops a job silently.
    pub async fn nack(
        &self,
        job: &QueueJob,
        error: &str,
        retry_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        if job.attempts >= job.max_attempts {
            warn!(
                job_id = %job.id,
                kind = job.kind.as_str(),
                attempts = job.attempts,
                error,
                "Retry budget exhausted, dead-lettering job"
            );
            self.db.dead_letter_job(job.id, error).await?;
            return Ok(());
        }

        let delay = retry_delay.unwrap_or_else(|| backoff_delay(job.attempts));
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        debug!(
            job_id = %job.id,
            attempt = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "Requeueing job"
        );
        self.db.release_job(job.id, error, visible_at).await?;
        Ok(())
    }

    /// Dead-letter a job immediately, regardless of remaining budget.
    pub async fn bury(&self, job: &QueueJob, error: &str) -> Result<(), QueueError> {
        warn!(job_id = %job.id, kind = job.kind.as_str(), error, "Dead-lettering job");
        self.db.dead_letter_job(job.id, error).await?;
        Ok(())
    }
}

/// Default requeue delay: 2^attempt seconds, capped at one minute.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(6);
    Duration::from_secs(secs.min(60))
}
