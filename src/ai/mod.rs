//! AI provider abstraction.
//!
//! One trait, two HTTP backends. The pipeline only ever sees
//! `Arc<dyn AiProvider>`; tests substitute a mock.

pub mod anthropic;
pub mod costs;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::error::AiError;

pub use anthropic::AnthropicProvider;
pub use costs::cost_for;
pub use openai::OpenAiProvider;

/// Supported AI backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiBackend {
    OpenAi,
    Anthropic,
}

/// One turn of conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiTurn {
    /// "user" or "assistant".
    pub role: String,
    pub content: String,
}

/// A generation request.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub system_prompt: String,
    /// Prior turns, oldest first. The final turn is the message to answer.
    pub history: Vec<AiTurn>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub model: String,
}

impl AiReply {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Text generation backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, request: AiRequest) -> Result<AiReply, AiError>;
}

/// Build the configured provider.
pub fn create_provider(config: &AiConfig) -> Arc<dyn AiProvider> {
    match config.backend {
        AiBackend::OpenAi => Arc::new(OpenAiProvider::new(config)),
        AiBackend::Anthropic => Arc::new(AnthropicProvider::new(config)),
    }
}

/// Parse a Retry-After header value (delta-seconds form only).
pub(crate) fn parse_retry_after(value: Option<&str>) -> Option<std::time::Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_after_parses_delta_seconds() {
        assert_eq!(parse_retry_after(Some("30")), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(Some(" 5 ")), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
