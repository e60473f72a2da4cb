//! Outbound delivery: retry policy, per-account throttle, and the
//! platform send client.

pub mod rate_limit;
pub mod retry;
pub mod sender;

pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use sender::{OutboundSender, WebhookCaller};
