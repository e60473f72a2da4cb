//! Per-account rule cache with a short TTL.
//!
//! Read-shared across all workers. Workers never write user edits here —
//! entries only reflect their own reads and expire on TTL. An external
//! rule editor can call `invalidate` to bust an account early.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::rules::model::AutomationRule;

struct CacheEntry {
    rules: Vec<AutomationRule>,
    fetched_at: Instant,
}

/// TTL cache of active rules keyed by account id.
pub struct RuleCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl RuleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get cached rules for an account, or `None` on miss/expiry.
    pub async fn get(&self, account_id: &str) -> Option<Vec<AutomationRule>> {
        let entries = self.entries.read().await;
        let entry = entries.get(account_id)?;
        if entry.fetched_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.rules.clone())
    }

    /// Record a fresh read from the backing store.
    pub async fn put(&self, account_id: &str, rules: Vec<AutomationRule>) {
        let mut entries = self.entries.write().await;
        entries.insert(
            account_id.to_string(),
            CacheEntry {
                rules,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop an account's entry (rule-edit signal from the owning service).
    pub async fn invalidate(&self, account_id: &str) {
        self.entries.write().await.remove(account_id);
    }
}
