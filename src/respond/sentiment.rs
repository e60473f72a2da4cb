//! Keyword sentiment heuristic for activity tagging.
//!
//! Deliberately crude. It never influences routing or generation, only
//! the `sentiment` column on activity rows.

const POSITIVE: &[&str] = &[
    "love", "great", "awesome", "amazing", "thanks", "thank you", "perfect", "excited",
    "beautiful", "yes", "cool", "nice",
];

const NEGATIVE: &[&str] = &[
    "hate", "terrible", "awful", "refund", "broken", "disappointed", "worst", "scam",
    "angry", "never", "cancel", "complaint",
];

/// Classify message text as "positive", "negative", or "neutral".
pub fn classify(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let positive = POSITIVE.iter().filter(|w| lower.contains(*w)).count();
    let negative = NEGATIVE.iter().filter(|w| lower.contains(*w)).count();
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => "positive",
        std::cmp::Ordering::Less => "negative",
        std::cmp::Ordering::Equal => "neutral",
    }
}
