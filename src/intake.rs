//! Intake worker logic: turn a queued webhook entry into stored events
//! plus their processing jobs.
//!
//! This is the pipeline's dedup point. Persisting the event and
//! enqueueing its processing job happen in one transaction, so a crash
//! between the two cannot strand an event with no job or double-process
//! a redelivered one.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::error::{QueueError, ValidationError};
use crate::event::InboundEvent;
use crate::queue::{JobKind, QueueJob};
use crate::store::Database;
use crate::webhook::envelope::{self, EnvelopeEntry};

/// Outcome of ingesting one entry.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Events newly stored (processing jobs enqueued).
    pub accepted: usize,
    /// Events dropped as already-seen redeliveries.
    pub duplicates: usize,
}

/// Parses queued webhook entries and ingests their events.
pub struct EventIntake {
    db: Arc<dyn Database>,
    process_max_attempts: u32,
}

impl EventIntake {
    pub fn new(db: Arc<dyn Database>, process_max_attempts: u32) -> Self {
        Self {
            db,
            process_max_attempts,
        }
    }

    /// Handle one intake job.
    ///
    /// A payload that does not hold an entry is a validation error; the
    /// caller buries the job rather than retrying it.
    pub async fn handle_job(&self, job: &QueueJob) -> Result<IngestOutcome, QueueError> {
        let entry: EnvelopeEntry = serde_json::from_value(job.payload["entry"].clone())
            .map_err(|e| QueueError::Payload {
                id: job.id,
                message: e.to_string(),
            })?;
        self.ingest_entry(&entry).await
    }

    /// Store every event in an entry and enqueue its processing job.
    pub async fn ingest_entry(&self, entry: &EnvelopeEntry) -> Result<IngestOutcome, QueueError> {
        let mut outcome = IngestOutcome::default();
        for event in envelope::events_from_entry(entry) {
            if let Err(e) = require_usable(&event) {
                debug!(event_id = %event.event_id, error = %e, "Dropping empty event");
                continue;
            }
            if self.ingest_event(&event).await? {
                outcome.accepted += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        if outcome.accepted > 0 || outcome.duplicates > 0 {
            info!(
                account_id = %entry.id,
                accepted = outcome.accepted,
                duplicates = outcome.duplicates,
                "Ingested webhook entry"
            );
        }
        Ok(outcome)
    }

    /// Store one event; returns false for an already-seen redelivery.
    pub async fn ingest_event(&self, event: &InboundEvent) -> Result<bool, QueueError> {
        let payload = json!({
            "account_id": event.account_id,
            "event_id": event.event_id,
        });
        let accepted = self
            .db
            .ingest_event(event, JobKind::ProcessMessage, &payload, self.process_max_attempts)
            .await?;
        if !accepted {
            debug!(
                account_id = %event.account_id,
                event_id = %event.event_id,
                "Duplicate event dropped"
            );
        }
        Ok(accepted)
    }
}

/// Validate an event has something to act on.
pub fn require_usable(event: &InboundEvent) -> Result<(), ValidationError> {
    if event.text.is_none() && event.attachments.is_empty() {
        return Err(ValidationError::EmptyEvent {
            event_id: event.event_id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::queue::JobStatus;
    use crate::store::LibSqlBackend;
    use chrono::Utc;
    use serde_json::json;

    fn entry(mid: &str, text: &str) -> EnvelopeEntry {
        serde_json::from_value(json!({
            "id": "acct_1",
            "time": 0,
            "messaging": [{
                "sender": {"id": "u1"},
                "recipient": {"id": "acct_1"},
                "timestamp": 0,
                "message": {"mid": mid, "text": text}
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn redelivered_entry_yields_no_second_job() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let intake = EventIntake::new(db.clone(), 3);

        let first = intake.ingest_entry(&entry("m.1", "hi")).await.unwrap();
        assert_eq!(first, IngestOutcome { accepted: 1, duplicates: 0 });

        let second = intake.ingest_entry(&entry("m.1", "hi")).await.unwrap();
        assert_eq!(second, IngestOutcome { accepted: 0, duplicates: 1 });

        assert_eq!(
            db.count_jobs(JobKind::ProcessMessage, JobStatus::Pending)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn processing_job_payload_points_at_stored_event() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let intake = EventIntake::new(db.clone(), 3);
        intake.ingest_entry(&entry("m.2", "hello")).await.unwrap();

        let job = db
            .claim_job(JobKind::ProcessMessage, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload["account_id"], "acct_1");
        assert_eq!(job.payload["event_id"], "m.2");

        let event = db
            .get_event("acct_1", job.payload["event_id"].as_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn malformed_job_payload_is_a_payload_error() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let intake = EventIntake::new(db, 3);
        let job = QueueJob {
            id: uuid::Uuid::new_v4(),
            kind: JobKind::WebhookIntake,
            payload: json!({"entry": "not an object"}),
            status: JobStatus::InFlight,
            attempts: 1,
            max_attempts: 3,
            visible_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            intake.handle_job(&job).await,
            Err(QueueError::Payload { .. })
        ));
    }

    #[test]
    fn textless_event_without_attachments_is_unusable() {
        let event = InboundEvent {
            event_id: "e".into(),
            account_id: "a".into(),
            sender_id: "s".into(),
            sender_handle: None,
            text: None,
            attachments: vec![],
            kind: EventKind::Message,
            received_at: Utc::now(),
        };
        assert!(require_usable(&event).is_err());
    }
}
