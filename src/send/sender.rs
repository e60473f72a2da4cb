//! Outbound delivery to the messaging platform, plus rule-configured
//! webhook calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::SendError;
use crate::send::rate_limit::RateLimiter;
use crate::send::retry::RetryPolicy;

/// Sends direct messages through the platform's Graph API.
pub struct OutboundSender {
    client: reqwest::Client,
    api_base: String,
    access_token: SecretString,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    recipient: Recipient<'a>,
    message: OutboundMessage<'a>,
}

#[derive(Serialize)]
struct Recipient<'a> {
    id: &'a str,
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: Option<String>,
}

#[derive(Deserialize)]
struct PlatformErrorBody {
    error: Option<PlatformError>,
}

#[derive(Deserialize)]
struct PlatformError {
    message: Option<String>,
    #[serde(default)]
    code: i64,
}

impl OutboundSender {
    pub fn new(
        api_base: String,
        access_token: SecretString,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            api_base,
            access_token,
            limiter,
            retry,
        }
    }

    /// Deliver a text reply. Returns the platform message id.
    ///
    /// The account throttle is consulted first: a saturated window comes
    /// back as `RateLimited` with the wait, before any attempt is spent.
    pub async fn send(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, SendError> {
        if let Err(wait) = self.limiter.check(account_id) {
            debug!(account_id, wait_ms = wait.as_millis() as u64, "Send throttled");
            return Err(SendError::RateLimited {
                retry_after: Some(wait),
            });
        }

        let message_id = self
            .retry
            .run(|| self.send_once(account_id, recipient_id, text))
            .await?;
        info!(account_id, message_id = %message_id, "Message delivered");
        Ok(message_id)
    }

    async fn send_once(
        &self,
        account_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> Result<String, SendError> {
        let url = format!("{}/{}/messages", self.api_base, account_id);
        let body = SendRequest {
            recipient: Recipient { id: recipient_id },
            message: OutboundMessage { text },
        };

        let response = self
            .client
            .post(&url)
            .query(&[("access_token", self.access_token.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SendError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(SendError::Network(format!("HTTP {status}")));
        }
        if status.is_client_error() {
            let message = response
                .json::<PlatformErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| "no error detail".into());
            return Err(SendError::PlatformRejected {
                code: status.as_u16(),
                message,
            });
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| SendError::InvalidResponse(e.to_string()))?;
        parsed
            .message_id
            .ok_or_else(|| SendError::InvalidResponse("no message_id in response".into()))
    }
}

/// Executes rule-configured webhook actions with their own retry budget.
pub struct WebhookCaller {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl WebhookCaller {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            retry,
        }
    }

    /// POST (or otherwise) the event payload to an external endpoint.
    pub async fn call(
        &self,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<(), SendError> {
        self.retry
            .run(|| self.call_once(url, method, headers, body))
            .await
    }

    async fn call_once(
        &self,
        url: &str,
        method: &str,
        headers: &HashMap<String, String>,
        body: &Value,
    ) -> Result<(), SendError> {
        let method = method
            .parse::<reqwest::Method>()
            .map_err(|_| SendError::PlatformRejected {
                code: 0,
                message: format!("invalid webhook method '{method}'"),
            })?;

        let mut request = self.client.request(method, url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SendError::Network(format!("HTTP {status}")));
        }
        warn!(url, status = status.as_u16(), "Webhook endpoint rejected payload");
        Err(SendError::PlatformRejected {
            code: status.as_u16(),
            message: format!("webhook returned {status}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_serializes_to_platform_shape() {
        let body = SendRequest {
            recipient: Recipient { id: "u1" },
            message: OutboundMessage { text: "hello" },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["recipient"]["id"], "u1");
        assert_eq!(json["message"]["text"], "hello");
    }

    #[test]
    fn error_body_shape_parses() {
        let raw = r#"{"error": {"message": "Invalid user id", "type": "OAuthException", "code": 100}}"#;
        let parsed: PlatformErrorBody = serde_json::from_str(raw).unwrap();
        let error = parsed.error.unwrap();
        assert_eq!(error.message.as_deref(), Some("Invalid user id"));
        assert_eq!(error.code, 100);
    }

    #[tokio::test]
    async fn throttled_send_spends_no_attempt() {
        let limiter = Arc::new(RateLimiter::new(0, Duration::from_secs(60)));
        let sender = OutboundSender::new(
            "http://127.0.0.1:1/unused".into(),
            SecretString::from("token"),
            limiter,
            RetryPolicy::new(3, Duration::from_millis(1)),
            Duration::from_secs(1),
        );
        let result = sender.send("acct", "u1", "hi").await;
        match result {
            Err(SendError::RateLimited { retry_after }) => assert!(retry_after.is_some()),
            other => panic!("Expected throttle, got {:?}", other),
        }
    }
}
