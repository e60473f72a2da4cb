//! dmflow — Instagram DM automation pipeline.
//!
//! Webhook intake feeds a durable job queue; workers parse and dedup
//! events, match them against user-configured automation rules, generate
//! a response (AI, template, or side effect), and deliver replies back
//! through the platform API with retry and per-account throttling.

pub mod activity;
pub mod ai;
pub mod config;
pub mod error;
pub mod event;
pub mod intake;
pub mod processor;
pub mod queue;
pub mod respond;
pub mod rules;
pub mod send;
pub mod store;
pub mod webhook;
pub mod worker;

pub use error::{Error, Result};
