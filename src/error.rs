//! Error types for the DM automation pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("AI provider error: {0}")]
    Ai(#[from] AiError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Intake authentication errors. These reject the request before any
/// queue entry is created.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Webhook signature missing")]
    MissingSignature,

    #[error("Webhook signature mismatch")]
    SignatureMismatch,

    #[error("Verify token mismatch")]
    VerifyTokenMismatch,
}

/// Malformed payloads or rule configs. Never retried — the event is
/// recorded as skipped.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed event envelope: {0}")]
    Envelope(String),

    #[error("Event {event_id} has no usable payload")]
    EmptyEvent { event_id: String },

    #[error("Invalid rule config for rule {rule_id}: {message}")]
    RuleConfig { rule_id: Uuid, message: String },
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job payload for {id}: {message}")]
    Payload { id: Uuid, message: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// AI provider errors. Propagated as a distinct kind — the generator
/// never silently swaps the primary reply for a heuristic.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outbound send errors toward the messaging platform.
///
/// The terminal variants matter to the job layer: `RateLimited` and
/// `Network` are requeueable, `PlatformRejected` is permanent.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Rate limited by platform, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Platform rejected message ({code}): {message}")]
    PlatformRejected { code: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Send retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("Invalid send response: {0}")]
    InvalidResponse(String),
}

impl SendError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Network(_))
    }

    /// Platform-supplied minimum wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Pipeline-stage errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Rule evaluation failed: {0}")]
    RuleMatch(String),

    #[error("Response generation failed: {0}")]
    Generation(String),

    #[error("Outbound webhook failed: {0}")]
    OutboundWebhook(String),

    #[error("Conversation append failed: {0}")]
    Conversation(String),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

impl PipelineError {
    /// Whether the job layer should retry this failure.
    ///
    /// Upstream service failures (AI, platform, network, storage) retry up
    /// to the job's attempt ceiling; everything else dead-letters fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Ai(AiError::RateLimited { .. }) => true,
            Self::Ai(AiError::RequestFailed { .. }) => true,
            Self::Send(e) => e.is_transient(),
            Self::OutboundWebhook(_) => true,
            Self::Database(_) => true,
            Self::Queue(_) => true,
            _ => false,
        }
    }

    /// Upstream-supplied minimum wait before the next attempt, if any.
    /// The job layer uses it as the requeue delay.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Ai(AiError::RateLimited { retry_after, .. }) => *retry_after,
            Self::Send(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
