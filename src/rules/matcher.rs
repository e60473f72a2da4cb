//! Rule matcher — selects the automation rule that applies to an event.
//!
//! Active rules are fetched cache-first (TTL ~5 minutes, falling through
//! to the backing store on miss) and evaluated in ascending priority
//! order. The first rule whose trigger is satisfied wins; later rules are
//! not evaluated. A rule whose config cannot be evaluated (e.g. an
//! invalid regex) degrades to non-matching — it never aborts the run.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::event::{EventKind, InboundEvent};
use crate::rules::cache::RuleCache;
use crate::rules::model::{AutomationRule, KeywordMatchType, TriggerCondition};
use crate::store::Database;

/// Compare `text` against a single keyword under the given match type.
///
/// Case-insensitive unless `case_sensitive` is set. Invalid regex
/// patterns are treated as non-matching.
pub fn matches_keyword(
    text: &str,
    keyword: &str,
    match_type: KeywordMatchType,
    case_sensitive: bool,
) -> bool {
    if let KeywordMatchType::Regex = match_type {
        return match RegexBuilder::new(keyword)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re.is_match(text),
            Err(e) => {
                warn!(pattern = %keyword, error = %e, "Invalid keyword regex, treating as non-match");
                false
            }
        };
    }

    let (text, keyword) = if case_sensitive {
        (text.to_string(), keyword.to_string())
    } else {
        (text.to_lowercase(), keyword.to_lowercase())
    };

    match match_type {
        KeywordMatchType::Contains => text.contains(&keyword),
        KeywordMatchType::Equals => text == keyword,
        KeywordMatchType::StartsWith => text.starts_with(&keyword),
        KeywordMatchType::EndsWith => text.ends_with(&keyword),
        KeywordMatchType::Regex => unreachable!("handled above"),
    }
}

/// First-match-wins rule matcher with a per-account TTL cache.
pub struct RuleMatcher {
    db: Arc<dyn Database>,
    cache: RuleCache,
}

impl RuleMatcher {
    pub fn new(db: Arc<dyn Database>, cache_ttl: Duration) -> Self {
        Self {
            db,
            cache: RuleCache::new(cache_ttl),
        }
    }

    /// Drop the cached rules for an account.
    pub async fn invalidate(&self, account_id: &str) {
        self.cache.invalidate(account_id).await;
    }

    /// Select the matching rule for an event, if any.
    ///
    /// `prior_messages` is the number of inbound messages already in the
    /// conversation before this event — zero means this is the first.
    pub async fn select(
        &self,
        event: &InboundEvent,
        prior_messages: usize,
    ) -> Result<Option<AutomationRule>, DatabaseError> {
        let rules = self.active_rules(&event.account_id).await?;

        for rule in &rules {
            if trigger_matches(&rule.trigger, event, prior_messages) {
                debug!(
                    rule_id = %rule.id,
                    rule = %rule.name,
                    trigger = rule.trigger.label(),
                    priority = rule.priority,
                    "Rule matched"
                );
                return Ok(Some(rule.clone()));
            }
        }

        debug!(
            account_id = %event.account_id,
            evaluated = rules.len(),
            "No rule matched"
        );
        Ok(None)
    }

    /// Fetch active rules, cache-first, sorted by ascending priority.
    async fn active_rules(&self, account_id: &str) -> Result<Vec<AutomationRule>, DatabaseError> {
        if let Some(rules) = self.cache.get(account_id).await {
            return Ok(rules);
        }

        let mut rules = self.db.find_active_rules(account_id).await?;
        rules.sort_by_key(|r| r.priority);
        self.cache.put(account_id, rules.clone()).await;
        Ok(rules)
    }
}

/// Evaluate one trigger condition against an event.
fn trigger_matches(
    trigger: &TriggerCondition,
    event: &InboundEvent,
    prior_messages: usize,
) -> bool {
    match trigger {
        TriggerCondition::Keyword {
            keywords,
            match_type,
            case_sensitive,
        } => {
            if event.kind != EventKind::Message {
                return false;
            }
            let text = event.text_or_empty();
            !text.is_empty()
                && keywords
                    .iter()
                    .any(|kw| matches_keyword(text, kw, *match_type, *case_sensitive))
        }
        TriggerCondition::FirstMessage => {
            event.kind == EventKind::Message && prior_messages == 0
        }
        TriggerCondition::Reaction => event.kind == EventKind::Reaction,
        TriggerCondition::StoryReply => event.kind == EventKind::StoryReply,
        TriggerCondition::Comment => event.kind == EventKind::Comment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::ActionConfig;
    use crate::store::LibSqlBackend;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_event(text: &str) -> InboundEvent {
        InboundEvent {
            event_id: "evt_1".into(),
            account_id: "acct_1".into(),
            sender_id: "user_9".into(),
            sender_handle: None,
            text: Some(text.into()),
            attachments: vec![],
            kind: EventKind::Message,
            received_at: Utc::now(),
        }
    }

    fn keyword_rule(keyword: &str, priority: i64) -> AutomationRule {
        AutomationRule {
            id: Uuid::new_v4(),
            account_id: "acct_1".into(),
            name: format!("kw-{keyword}"),
            is_active: true,
            trigger: TriggerCondition::Keyword {
                keywords: vec![keyword.into()],
                match_type: KeywordMatchType::Contains,
                case_sensitive: false,
            },
            action: ActionConfig::PredefinedMessage {
                template: "ok".into(),
                variables: Default::default(),
            },
            priority,
        }
    }

    // ── Keyword matching ────────────────────────────────────────────

    #[test]
    fn contains_is_case_insensitive_by_default() {
        assert!(matches_keyword(
            "I love your Pricing!",
            "pricing",
            KeywordMatchType::Contains,
            false
        ));
        assert!(!matches_keyword(
            "I love your Pricing!",
            "pricing",
            KeywordMatchType::Contains,
            true
        ));
    }

    #[test]
    fn equals_and_affix_matching() {
        assert!(matches_keyword("Hello", "hello", KeywordMatchType::Equals, false));
        assert!(!matches_keyword("Hello there", "hello", KeywordMatchType::Equals, false));
        assert!(matches_keyword(
            "price list please",
            "price",
            KeywordMatchType::StartsWith,
            false
        ));
        assert!(matches_keyword(
            "what's the price",
            "price",
            KeywordMatchType::EndsWith,
            false
        ));
    }

    #[test]
    fn regex_matching() {
        assert!(matches_keyword(
            "order #4521 arrived",
            r"order #\d+",
            KeywordMatchType::Regex,
            false
        ));
        assert!(matches_keyword(
            "PRICE?",
            r"^price",
            KeywordMatchType::Regex,
            false
        ));
        assert!(!matches_keyword(
            "PRICE?",
            r"^price",
            KeywordMatchType::Regex,
            true
        ));
    }

    #[test]
    fn invalid_regex_never_matches() {
        assert!(!matches_keyword(
            "anything",
            r"([unclosed",
            KeywordMatchType::Regex,
            false
        ));
    }

    // ── Trigger evaluation ──────────────────────────────────────────

    #[test]
    fn first_message_trigger_requires_empty_history() {
        let event = make_event("hi!");
        assert!(trigger_matches(&TriggerCondition::FirstMessage, &event, 0));
        assert!(!trigger_matches(&TriggerCondition::FirstMessage, &event, 3));
    }

    #[test]
    fn sub_type_triggers_match_event_kind() {
        let mut event = make_event("");
        event.kind = EventKind::StoryReply;
        assert!(trigger_matches(&TriggerCondition::StoryReply, &event, 5));
        assert!(!trigger_matches(&TriggerCondition::Reaction, &event, 5));
        assert!(!trigger_matches(&TriggerCondition::FirstMessage, &event, 0));
    }

    #[test]
    fn keyword_trigger_ignores_textless_events() {
        let mut event = make_event("");
        event.text = None;
        let trigger = TriggerCondition::Keyword {
            keywords: vec!["price".into()],
            match_type: KeywordMatchType::Contains,
            case_sensitive: false,
        };
        assert!(!trigger_matches(&trigger, &event, 0));
    }

    // ── Matcher with store ──────────────────────────────────────────

    #[tokio::test]
    async fn priority_order_first_match_wins() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        // R1 (priority 1, keyword "price") and R2 (priority 2, first_message):
        // a first message containing "price" must match R1 only.
        let r1 = keyword_rule("price", 1);
        let r2 = AutomationRule {
            id: Uuid::new_v4(),
            account_id: "acct_1".into(),
            name: "welcome".into(),
            is_active: true,
            trigger: TriggerCondition::FirstMessage,
            action: ActionConfig::PredefinedMessage {
                template: "welcome!".into(),
                variables: Default::default(),
            },
            priority: 2,
        };
        db.upsert_rule(&r2).await.unwrap();
        db.upsert_rule(&r1).await.unwrap();

        let matcher = RuleMatcher::new(db, Duration::from_secs(300));
        let event = make_event("what's the price?");
        let matched = matcher.select(&event, 0).await.unwrap().unwrap();
        assert_eq!(matched.id, r1.id);
    }

    #[tokio::test]
    async fn inactive_rules_are_not_considered() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut rule = keyword_rule("price", 1);
        rule.is_active = false;
        db.upsert_rule(&rule).await.unwrap();

        let matcher = RuleMatcher::new(db, Duration::from_secs(300));
        let matched = matcher.select(&make_event("price?"), 2).await.unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn cache_serves_second_lookup_and_invalidation_refetches() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.upsert_rule(&keyword_rule("price", 1)).await.unwrap();

        let matcher = RuleMatcher::new(Arc::clone(&db), Duration::from_secs(300));
        assert!(matcher.select(&make_event("price"), 1).await.unwrap().is_some());

        // New rule is invisible until the cache is busted
        db.upsert_rule(&keyword_rule("hours", 0)).await.unwrap();
        assert!(matcher.select(&make_event("hours?"), 1).await.unwrap().is_none());

        matcher.invalidate("acct_1").await;
        assert!(matcher.select(&make_event("hours?"), 1).await.unwrap().is_some());
    }
}
