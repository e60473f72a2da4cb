//! Webhook payload signature validation.
//!
//! The platform signs every POST body with HMAC-SHA256 over the raw
//! bytes, delivered as `X-Hub-Signature-256: sha256=<hex>`. Validation
//! happens before the body is parsed and fails closed: a missing header,
//! malformed hex, or an empty configured secret all reject the request.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Validate a signature header against the raw request body.
pub fn validate(raw_body: &[u8], signature_header: Option<&str>, app_secret: &SecretString) -> bool {
    let secret = app_secret.expose_secret();
    if secret.is_empty() {
        warn!("App secret is empty, rejecting webhook");
        return false;
    }

    let Some(header) = signature_header else {
        return false;
    };
    let Some(hex_digest) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    // Constant-time comparison
    mac.verify_slice(&expected).is_ok()
}
