//! Automation rules — model, matching, and the per-account cache.

pub mod cache;
pub mod matcher;
pub mod model;

pub use cache::RuleCache;
pub use matcher::{RuleMatcher, matches_keyword};
pub use model::{
    ActionConfig, AutomationRule, KeywordMatchType, TonePreset, TriggerCondition,
};
