//! Tracked conversation content and importance scoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of tracked content. Closed set so compaction rules can match
/// exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    System,
    User,
    Assistant,
    Tool,
    Decision,
    Error,
    Pattern,
    Summary,
}

impl ContentKind {
    /// Kinds that survive every compaction pass.
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::Decision | Self::Error | Self::Pattern)
    }

    /// Base importance by kind.
    fn base_importance(&self) -> f64 {
        match self {
            Self::Decision | Self::Error | Self::Pattern => 0.9,
            Self::Tool => 0.6,
            Self::Assistant => 0.5,
            Self::User | Self::Summary => 0.4,
            Self::System => 0.3,
        }
    }
}

/// Keywords that raise an item's importance.
const BOOST_KEYWORDS: [&str; 3] = ["fail", "error", "requirement"];

/// Character length beyond which the length penalty applies.
const LENGTH_PENALTY_CHARS: usize = 4_000;

/// One unit of tracked conversation content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub kind: ContentKind,
    pub text: String,
    pub token_count: u32,
    /// Monotone non-decreasing over the item's lifetime.
    importance: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ContentItem {
    /// Create an item, scoring importance from kind, keywords, and length.
    pub fn new(kind: ContentKind, text: &str, token_count: u32) -> Self {
        Self {
            kind,
            text: text.to_string(),
            token_count,
            importance: score_importance(kind, text),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn importance(&self) -> f64 {
        self.importance
    }

    /// Raise importance. Lower values are ignored; importance never drops.
    pub fn raise_importance(&mut self, importance: f64) {
        if importance > self.importance {
            self.importance = importance.min(1.0);
        }
    }

    /// Items the compactor must never drop.
    pub fn is_critical(&self) -> bool {
        self.kind.is_protected() || self.importance >= 0.9
    }
}

/// Importance = base(kind) + keyword boost − length penalty, clamped to [0,1].
fn score_importance(kind: ContentKind, text: &str) -> f64 {
    let mut score = kind.base_importance();

    let lowered = text.to_lowercase();
    if BOOST_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
        score += 0.2;
    }
    if text.chars().count() > LENGTH_PENALTY_CHARS {
        score -= 0.1;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_kinds_score_high() {
        for kind in [ContentKind::Decision, ContentKind::Error, ContentKind::Pattern] {
            let item = ContentItem::new(kind, "short note", 3);
            assert!(item.importance() >= 0.9, "{kind:?} should start at 0.9");
            assert!(item.is_critical());
        }
    }

    #[test]
    fn kind_ordering_is_monotone() {
        let decision = ContentItem::new(ContentKind::Decision, "x", 1).importance();
        let tool = ContentItem::new(ContentKind::Tool, "x", 1).importance();
        let assistant = ContentItem::new(ContentKind::Assistant, "x", 1).importance();
        let user = ContentItem::new(ContentKind::User, "x", 1).importance();
        let system = ContentItem::new(ContentKind::System, "x", 1).importance();

        assert!(decision > tool);
        assert!(tool > assistant);
        assert!(assistant > user);
        assert!(user > system);
    }

    #[test]
    fn keyword_boost_applies() {
        let plain = ContentItem::new(ContentKind::User, "please add a parser", 5);
        let boosted = ContentItem::new(ContentKind::User, "the build will FAIL without this", 8);
        assert!(boosted.importance() > plain.importance());
    }

    #[test]
    fn length_penalty_applies() {
        let long_text = "a".repeat(5_000);
        let short = ContentItem::new(ContentKind::Assistant, "short", 2);
        let long = ContentItem::new(ContentKind::Assistant, &long_text, 1_250);
        assert!(long.importance() < short.importance());
    }

    #[test]
    fn importance_caps_at_one() {
        let text = format!("error failure requirement {}", "x".repeat(10));
        let item = ContentItem::new(ContentKind::Decision, &text, 10);
        assert!(item.importance() <= 1.0);
    }

    #[test]
    fn importance_is_monotone_nondecreasing() {
        let mut item = ContentItem::new(ContentKind::User, "note", 2);
        let initial = item.importance();

        item.raise_importance(initial - 0.1);
        assert_eq!(item.importance(), initial);

        item.raise_importance(0.95);
        assert_eq!(item.importance(), 0.95);
        assert!(item.is_critical());

        item.raise_importance(2.0);
        assert_eq!(item.importance(), 1.0);
    }

    #[test]
    fn high_importance_non_protected_kind_is_critical() {
        let mut item = ContentItem::new(ContentKind::Tool, "output", 3);
        assert!(!item.is_critical());
        item.raise_importance(0.9);
        assert!(item.is_critical());
    }

    #[test]
    fn item_round_trips_through_serde() {
        let item = ContentItem::new(ContentKind::Pattern, "reusable approach", 4);
        let json = serde_json::to_string(&item).unwrap();
        let back: ContentItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }
}
