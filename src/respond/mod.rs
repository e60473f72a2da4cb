//! Response generation: templates, AI replies, and side-effect actions.

pub mod generator;
pub mod sentiment;
pub mod template;

pub use generator::{AiUsage, ResponseGenerator, ResponseOutcome};
