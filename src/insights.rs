//! Keyword-derived query insights: intent, sentiment, and urgency.
//!
//! Deliberately simple membership tests over the lowercased query. The
//! first matching intent class wins in the fixed priority order
//! purchase > research > support > browse.

use crate::models::{Intent, QueryInsights, Sentiment, Urgency};

const PURCHASE_KEYWORDS: &[&str] = &["buy", "price", "cheap", "best", "deal", "sale", "discount"];
const RESEARCH_KEYWORDS: &[&str] = &["review", "compare", "vs", "difference", "how to", "guide"];
const SUPPORT_KEYWORDS: &[&str] = &["return", "warranty", "shipping", "help", "support"];

const POSITIVE_WORDS: &[&str] = &["love", "great", "excellent", "perfect", "amazing", "best"];
const NEGATIVE_WORDS: &[&str] = &["bad", "poor", "terrible", "worst", "hate", "problem"];

const URGENT_KEYWORDS: &[&str] = &["urgent", "asap", "today", "now", "immediately", "quick", "fast"];

pub fn classify_intent(query: &str) -> Intent {
    let q = query.to_lowercase();
    if PURCHASE_KEYWORDS.iter().any(|k| q.contains(k)) {
        Intent::Purchase
    } else if RESEARCH_KEYWORDS.iter().any(|k| q.contains(k)) {
        Intent::Research
    } else if SUPPORT_KEYWORDS.iter().any(|k| q.contains(k)) {
        Intent::Support
    } else {
        Intent::Browse
    }
}

pub fn classify_sentiment(query: &str) -> Sentiment {
    let q = query.to_lowercase();
    let positive = POSITIVE_WORDS.iter().filter(|k| q.contains(*k)).count() as i64;
    let negative = NEGATIVE_WORDS.iter().filter(|k| q.contains(*k)).count() as i64;

    match positive - negative {
        d if d > 0 => Sentiment::Positive,
        d if d < 0 => Sentiment::Negative,
        _ => Sentiment::Neutral,
    }
}

pub fn classify_urgency(query: &str) -> Urgency {
    let q = query.to_lowercase();
    if URGENT_KEYWORDS.iter().any(|k| q.contains(k)) {
        Urgency::High
    } else {
        Urgency::Normal
    }
}

/// Runs all three classifiers and attaches merchandising notes.
pub fn build_insights(query: &str) -> QueryInsights {
    let intent = classify_intent(query);
    let sentiment = classify_sentiment(query);
    let urgency = classify_urgency(query);

    let mut notes = Vec::new();
    if intent == Intent::Purchase {
        notes.push("Shopper shows purchase intent; surface bestsellers in this category".to_string());
    }
    if urgency == Urgency::High {
        notes.push("High urgency; surface fast-shipping options".to_string());
    }

    QueryInsights {
        intent,
        sentiment,
        urgency,
        notes,
    }
}
