//! Webhook HTTP surface: the verify handshake and the intake endpoint.
//!
//! Intake does the minimum on the request path: validate the signature
//! over the raw bytes, frame-check the envelope, and enqueue one intake
//! job per entry. Parsing, dedup, and rule evaluation all happen in
//! workers so the platform gets its ack well inside its delivery budget.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::AuthError;
use crate::queue::{JobKind, JobQueue};
use crate::webhook::envelope;
use crate::webhook::signature;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub queue: JobQueue,
    pub verify_token: Arc<String>,
    pub app_secret: SecretString,
    pub intake_max_attempts: u32,
}

/// Build the webhook router.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(verify_handshake).post(receive))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /webhook — the platform's subscription verify handshake.
async fn verify_handshake(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if mode == Some("subscribe") && token == Some(state.verify_token.as_str()) {
        info!("Webhook verify handshake succeeded");
        (StatusCode::OK, challenge)
    } else {
        warn!(?mode, error = %AuthError::VerifyTokenMismatch, "Webhook verify handshake rejected");
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// POST /webhook — signed event delivery.
async fn receive(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if !signature::validate(&body, signature_header, &state.app_secret) {
        let reason = if signature_header.is_none() {
            AuthError::MissingSignature
        } else {
            AuthError::SignatureMismatch
        };
        warn!(error = %reason, "Webhook rejected");
        return StatusCode::FORBIDDEN;
    }

    let envelope = match envelope::parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed webhook envelope");
            return StatusCode::BAD_REQUEST;
        }
    };

    // One job per entry. The 200 ack means every entry is durably queued;
    // a failed enqueue turns the whole delivery into a 500 so the platform
    // redelivers, and dedup absorbs the entries that did land.
    let mut enqueue_failed = false;
    for entry in &envelope.entry {
        let payload = json!({ "entry": entry });
        match state
            .queue
            .enqueue(
                JobKind::WebhookIntake,
                payload,
                state.intake_max_attempts,
                None,
            )
            .await
        {
            Ok(job_id) => {
                debug!(job_id = %job_id, account_id = %entry.id, "Queued webhook entry")
            }
            Err(e) => {
                warn!(error = %e, account_id = %entry.id, "Failed to queue webhook entry");
                enqueue_failed = true;
            }
        }
    }

    if enqueue_failed {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}
