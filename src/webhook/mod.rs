//! Webhook intake: verify handshake, signature validation, envelope
//! parsing, and the HTTP routes that feed the queue.

pub mod envelope;
pub mod routes;
pub mod signature;

pub use routes::{WebhookState, router};
