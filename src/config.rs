//! Configuration types.
//!
//! Everything is read from the environment at startup. Tunables carry
//! defaults matching the platform's delivery characteristics (sub-second
//! webhook acks, ~24h redelivery window, interactive send budgets).

use std::time::Duration;

use secrecy::SecretString;

use crate::ai::AiBackend;
use crate::error::ConfigError;

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Token echoed back during the platform's webhook verify handshake.
    pub verify_token: String,
    /// App secret used to validate `X-Hub-Signature-256` headers.
    pub app_secret: SecretString,
    /// Address the webhook server binds to.
    pub bind_addr: String,
    /// Path to the local database file.
    pub db_path: String,
    /// Messaging platform access token (query parameter on sends).
    pub access_token: SecretString,
    /// Base URL of the messaging platform's Graph API.
    pub graph_api_base: String,
    /// AI provider selection + credentials.
    pub ai: AiConfig,
    /// Pipeline tunables.
    pub pipeline: PipelineConfig,
}

/// AI provider configuration.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub backend: AiBackend,
    pub api_key: SecretString,
    pub model: String,
    /// Request timeout for generation calls.
    pub timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rule cache TTL per account.
    pub rule_cache_ttl: Duration,
    /// Conversation turns included as AI context.
    pub history_turns: usize,
    /// Send attempts for queued background sends.
    pub send_max_attempts: u32,
    /// Base delay for send backoff (doubles each attempt).
    pub send_base_delay: Duration,
    /// Request timeout for a single send attempt.
    pub send_timeout: Duration,
    /// Outbound sends allowed per account per window.
    pub send_rate_max: usize,
    /// Sliding window for the send throttle.
    pub send_rate_window: Duration,
    /// Retry attempts for outbound webhook actions (separate budget).
    pub webhook_action_max_attempts: u32,
    /// Queue visibility timeout — abandoned jobs become claimable again.
    pub job_visibility_timeout: Duration,
    /// Queue poll interval when no job is available.
    pub job_poll_interval: Duration,
    /// Workers per job kind.
    pub workers_per_kind: usize,
    /// Optional generic reply sent when AI generation fails. `None` means
    /// the sender receives nothing (the attempt is recorded as failed).
    pub fallback_reply: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rule_cache_ttl: Duration::from_secs(300),
            history_turns: 10,
            send_max_attempts: 5,
            send_base_delay: Duration::from_secs(1),
            send_timeout: Duration::from_secs(30),
            send_rate_max: 60,
            send_rate_window: Duration::from_secs(60),
            webhook_action_max_attempts: 3,
            job_visibility_timeout: Duration::from_secs(60),
            job_poll_interval: Duration::from_secs(1),
            workers_per_kind: 2,
            fallback_reply: None,
        }
    }
}

impl Config {
    /// Build configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let verify_token = require("DMFLOW_VERIFY_TOKEN")?;
        let app_secret = SecretString::from(require("DMFLOW_APP_SECRET")?);
        let access_token = SecretString::from(require("DMFLOW_ACCESS_TOKEN")?);

        let bind_addr =
            std::env::var("DMFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let db_path =
            std::env::var("DMFLOW_DB_PATH").unwrap_or_else(|_| "./data/dmflow.db".to_string());
        let graph_api_base = std::env::var("DMFLOW_GRAPH_API_BASE")
            .unwrap_or_else(|_| "https://graph.facebook.com/v21.0".to_string());

        let backend = match std::env::var("DMFLOW_AI_BACKEND").as_deref() {
            Ok("openai") => AiBackend::OpenAi,
            Ok("anthropic") | Err(_) => AiBackend::Anthropic,
            Ok(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "DMFLOW_AI_BACKEND".into(),
                    message: format!("unknown backend '{other}'"),
                });
            }
        };
        let api_key = SecretString::from(require(match backend {
            AiBackend::OpenAi => "OPENAI_API_KEY",
            AiBackend::Anthropic => "ANTHROPIC_API_KEY",
        })?);
        let model = std::env::var("DMFLOW_AI_MODEL").unwrap_or_else(|_| match backend {
            AiBackend::OpenAi => "gpt-4o-mini".to_string(),
            AiBackend::Anthropic => "claude-3-5-haiku-latest".to_string(),
        });

        let mut pipeline = PipelineConfig::default();
        if let Ok(v) = std::env::var("DMFLOW_FALLBACK_REPLY")
            && !v.trim().is_empty()
        {
            pipeline.fallback_reply = Some(v);
        }
        if let Ok(v) = std::env::var("DMFLOW_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            pipeline.workers_per_kind = n.max(1);
        }

        Ok(Self {
            verify_token,
            app_secret,
            bind_addr,
            db_path,
            access_token,
            graph_api_base,
            ai: AiConfig {
                backend,
                api_key,
                model,
                timeout: Duration::from_secs(20),
                max_tokens: 512,
                temperature: 0.7,
            },
            pipeline,
        })
    }
}

fn require(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_match_platform_budgets() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.send_max_attempts, 5);
        assert_eq!(cfg.rule_cache_ttl, Duration::from_secs(300));
        assert_eq!(cfg.job_visibility_timeout, Duration::from_secs(60));
        assert!(cfg.fallback_reply.is_none());
    }
}
