//! Queue workers — one polling loop per job kind.
//!
//! Every loop follows the same shape: claim, dispatch, then ack, nack,
//! or bury. Jobs are never dropped without a terminal state; anything a
//! retry cannot heal dead-letters with its last error attached.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::{ActivityRecorder, ActivityStatus, ActivityUpdate};
use crate::error::{QueueError, SendError};
use crate::intake::EventIntake;
use crate::processor::MessageProcessor;
use crate::queue::{JobKind, JobQueue, QueueJob};
use crate::send::OutboundSender;
use crate::store::Database;

/// Everything a worker loop needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<dyn Database>,
    pub queue: JobQueue,
    pub intake: Arc<EventIntake>,
    pub processor: Arc<MessageProcessor>,
    pub sender: Arc<OutboundSender>,
    pub recorder: Arc<ActivityRecorder>,
    pub poll_interval: Duration,
}

/// Spawn `per_kind` workers for each job kind.
pub fn spawn_workers(ctx: WorkerContext, per_kind: usize) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for kind in [
        JobKind::WebhookIntake,
        JobKind::ProcessMessage,
        JobKind::SendMessage,
    ] {
        for n in 0..per_kind.max(1) {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                info!(kind = kind.as_str(), worker = n, "Worker started");
                run_loop(ctx, kind).await;
            }));
        }
    }
    handles
}

/// Periodically drop inbound events older than the retention window.
///
/// Dedup only has to survive the platform's ~24h redelivery window, so a
/// multi-day retention leaves plenty of margin.
pub fn spawn_event_pruner(
    db: Arc<dyn Database>,
    keep_days: u32,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match db.prune_events(keep_days).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, keep_days, "Pruned old inbound events"),
                Err(e) => warn!(error = %e, "Event pruning failed"),
            }
        }
    })
}

async fn run_loop(ctx: WorkerContext, kind: JobKind) {
    loop {
        match ctx.queue.dequeue(kind).await {
            Ok(Some(job)) => {
                dispatch(&ctx, kind, &job).await;
            }
            Ok(None) => {
                tokio::time::sleep(ctx.poll_interval).await;
            }
            Err(e) => {
                error!(kind = kind.as_str(), error = %e, "Dequeue failed");
                tokio::time::sleep(ctx.poll_interval).await;
            }
        }
    }
}

/// Run one job and settle its queue state.
pub async fn dispatch(ctx: &WorkerContext, kind: JobKind, job: &QueueJob) {
    let settled = match kind {
        JobKind::WebhookIntake => handle_intake(ctx, job).await,
        JobKind::ProcessMessage => handle_process(ctx, job).await,
        JobKind::SendMessage => handle_send(ctx, job).await,
    };
    if let Err(e) = settled {
        // Settling itself failed (storage trouble); the visibility timeout
        // will surface the job again.
        error!(job_id = %job.id, error = %e, "Failed to settle job state");
    }
}

async fn handle_intake(ctx: &WorkerContext, job: &QueueJob) -> Result<(), QueueError> {
    match ctx.intake.handle_job(job).await {
        Ok(_outcome) => ctx.queue.ack(job).await,
        Err(e @ QueueError::Payload { .. }) => {
            warn!(job_id = %job.id, error = %e, "Unparseable intake payload");
            ctx.queue.bury(job, &e.to_string()).await
        }
        Err(e) => ctx.queue.nack(job, &e.to_string(), None).await,
    }
}

async fn handle_process(ctx: &WorkerContext, job: &QueueJob) -> Result<(), QueueError> {
    match ctx.processor.handle_job(job).await {
        Ok(()) => ctx.queue.ack(job).await,
        Err(e) if e.is_retryable() => {
            debug!(job_id = %job.id, error = %e, "Processing failed, requeueing");
            if job.attempts >= job.max_attempts {
                fail_pending_process(ctx, job, e.to_string()).await;
            }
            ctx.queue.nack(job, &e.to_string(), e.retry_after()).await
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Processing failed permanently");
            ctx.queue.bury(job, &e.to_string()).await
        }
    }
}

/// A dead-lettered processing job must not strand its activity row in
/// `pending`; the last error becomes the row's terminal state.
async fn fail_pending_process(ctx: &WorkerContext, job: &QueueJob, error: String) {
    let account_id = job.payload["account_id"].as_str().unwrap_or_default();
    let event_id = job.payload["event_id"].as_str().unwrap_or_default();
    match ctx.db.find_pending_activity(account_id, event_id).await {
        Ok(Some(id)) => fail_activity(&ctx.recorder, Some(id), error).await,
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, event_id, "Failed to look up activity row for exhausted job")
        }
    }
}

async fn handle_send(ctx: &WorkerContext, job: &QueueJob) -> Result<(), QueueError> {
    let account_id = job.payload["account_id"].as_str().unwrap_or_default();
    let recipient_id = job.payload["recipient_id"].as_str().unwrap_or_default();
    let text = job.payload["text"].as_str().unwrap_or_default();
    let activity_id = job.payload["activity_id"]
        .as_str()
        .and_then(|s| s.parse::<Uuid>().ok());

    if account_id.is_empty() || recipient_id.is_empty() || text.is_empty() {
        warn!(job_id = %job.id, "Send job payload is incomplete");
        return ctx.queue.bury(job, "incomplete send payload").await;
    }

    // A reclaimed job whose first claim actually delivered must not send
    // twice: the activity row is the idempotency record.
    if let Some(id) = activity_id
        && let Some(status) = ctx.recorder.status(id).await
        && status.is_terminal()
    {
        debug!(job_id = %job.id, status = status.as_str(), "Send already resolved, skipping");
        return ctx.queue.ack(job).await;
    }

    match ctx.sender.send(account_id, recipient_id, text).await {
        Ok(message_id) => {
            ctx.recorder
                .update(
                    activity_id,
                    ActivityUpdate {
                        status: Some(ActivityStatus::Success),
                        platform_message_id: Some(message_id),
                        ..Default::default()
                    },
                )
                .await;
            // Our reply joins the history so later AI calls see it
            if let Err(e) = ctx
                .db
                .append_conversation_message(account_id, recipient_id, "assistant", text, Utc::now(), None)
                .await
            {
                warn!(error = %e, "Failed to append assistant reply to conversation");
            }
            ctx.queue.ack(job).await
        }
        Err(e @ SendError::RateLimited { .. }) => {
            if job.attempts >= job.max_attempts {
                fail_activity(&ctx.recorder, activity_id, e.to_string()).await;
            }
            ctx.queue.nack(job, &e.to_string(), e.retry_after()).await
        }
        Err(e @ (SendError::Network(_) | SendError::Exhausted { .. })) => {
            if job.attempts >= job.max_attempts {
                fail_activity(&ctx.recorder, activity_id, e.to_string()).await;
            }
            ctx.queue.nack(job, &e.to_string(), None).await
        }
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Platform rejected message");
            fail_activity(&ctx.recorder, activity_id, e.to_string()).await;
            ctx.queue.bury(job, &e.to_string()).await
        }
    }
}

/// Terminal failure for an attempt whose retries are spent.
async fn fail_activity(recorder: &ActivityRecorder, activity_id: Option<Uuid>, error: String) {
    recorder
        .update(
            activity_id,
            ActivityUpdate {
                status: Some(ActivityStatus::Failed),
                error_message: Some(error),
                ..Default::default()
            },
        )
        .await;
}
