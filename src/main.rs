use std::path::Path;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dmflow::activity::ActivityRecorder;
use dmflow::ai;
use dmflow::config::Config;
use dmflow::intake::EventIntake;
use dmflow::processor::{ConversationLocks, MessageProcessor};
use dmflow::queue::JobQueue;
use dmflow::respond::ResponseGenerator;
use dmflow::rules::RuleMatcher;
use dmflow::send::{OutboundSender, RateLimiter, RetryPolicy, WebhookCaller};
use dmflow::store::{Database, LibSqlBackend};
use dmflow::webhook::{self, WebhookState};
use dmflow::worker::{self, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(bind_addr = %config.bind_addr, "Starting dmflow");

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(Path::new(&config.db_path)).await?);
    let pipeline = config.pipeline.clone();

    let queue = JobQueue::new(db.clone(), pipeline.job_visibility_timeout);
    let ai_provider = ai::create_provider(&config.ai);
    info!(model = ai_provider.model_name(), "AI provider ready");

    let limiter = Arc::new(RateLimiter::new(
        pipeline.send_rate_max,
        pipeline.send_rate_window,
    ));
    let sender = Arc::new(OutboundSender::new(
        config.graph_api_base.clone(),
        config.access_token.clone(),
        limiter,
        RetryPolicy::new(pipeline.send_max_attempts, pipeline.send_base_delay),
        pipeline.send_timeout,
    ));

    let processor = Arc::new(MessageProcessor::new(
        db.clone(),
        RuleMatcher::new(db.clone(), pipeline.rule_cache_ttl),
        ResponseGenerator::new(
            db.clone(),
            ai_provider,
            pipeline.history_turns,
            config.ai.max_tokens,
            config.ai.temperature,
        ),
        queue.clone(),
        ActivityRecorder::new(db.clone()),
        WebhookCaller::new(
            RetryPolicy::new(pipeline.webhook_action_max_attempts, pipeline.send_base_delay),
            pipeline.send_timeout,
        ),
        ConversationLocks::new(),
        pipeline.clone(),
    ));

    let ctx = WorkerContext {
        db: db.clone(),
        queue: queue.clone(),
        intake: Arc::new(EventIntake::new(db.clone(), pipeline.send_max_attempts)),
        processor,
        sender,
        recorder: Arc::new(ActivityRecorder::new(db.clone())),
        poll_interval: pipeline.job_poll_interval,
    };
    let workers = worker::spawn_workers(ctx, pipeline.workers_per_kind);
    info!(count = workers.len(), "Workers running");
    worker::spawn_event_pruner(db.clone(), 30, std::time::Duration::from_secs(6 * 60 * 60));

    let app = webhook::router(WebhookState {
        queue,
        verify_token: Arc::new(config.verify_token.clone()),
        app_secret: config.app_secret.clone(),
        intake_max_attempts: pipeline.send_max_attempts,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Webhook server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
