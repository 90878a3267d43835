//! Context compaction: reduce tracked items while preserving critical ones.
//!
//! Compaction is a pure function of the input items and a policy; it holds
//! no reference back to the manager that drives it. The hybrid strategy
//! keeps recency (the last N items) and importance (protected kinds and
//! high scores), then summarizes the rest through an injected summarizer.

use crate::budget::TokenMeter;
use crate::context::item::{ContentItem, ContentKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Produces a prose summary of content items. Usually backed by an LLM;
/// tests inject deterministic stubs.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, items: &[ContentItem]) -> anyhow::Result<String>;
}

/// Compaction policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Most recent items always kept (default 8, ~4 interactions).
    pub keep_recent: usize,
    /// Summary token count must be below this fraction of summarized input.
    pub summary_ratio: f64,
    /// Minimum summary length in characters for acceptance.
    pub min_summary_chars: usize,
    /// Minimum total token reduction for acceptance, as a fraction.
    pub min_reduction: f64,
    /// Summaries matching any of these phrases are refusals.
    pub refusal_phrases: Vec<String>,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            keep_recent: 8,
            summary_ratio: 0.25,
            min_summary_chars: 100,
            min_reduction: 0.10,
            refusal_phrases: vec![
                "I don't see the content".to_string(),
                "I cannot summarize".to_string(),
                "there is no content".to_string(),
            ],
        }
    }
}

/// Why a compaction pass was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Nothing outside the protected set to summarize.
    NothingToCompact,
    /// Summary shorter than the minimum.
    SummaryTooShort,
    /// Summary did not fit under the ratio target.
    SummaryTooLarge,
    /// Summary matched a refusal phrase.
    Refusal,
    /// Total reduction below the minimum.
    InsufficientReduction,
}

/// Result of a compaction pass.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Compaction accepted; `items` is the replacement list.
    Accepted {
        items: Vec<ContentItem>,
        tokens_before: u64,
        tokens_after: u64,
    },
    /// Pass rejected; caller state is unchanged.
    Rejected { reason: RejectReason },
    /// Summarizer failed and the deterministic fallback could not meet the
    /// target either. Caller emits a degraded `context_update` event.
    Degraded { reason: String },
}

impl CompactionOutcome {
    /// Fractional reduction for accepted outcomes, zero otherwise.
    pub fn reduction(&self) -> f64 {
        match self {
            Self::Accepted {
                tokens_before,
                tokens_after,
                ..
            } if *tokens_before > 0 => 1.0 - (*tokens_after as f64 / *tokens_before as f64),
            _ => 0.0,
        }
    }
}

/// Split items into (kept, summarizable) per the policy.
///
/// Kept: the last `keep_recent` items plus every critical item. The rest
/// is eligible for summarization or dropping.
fn partition(items: &[ContentItem], policy: &CompactionPolicy) -> (Vec<usize>, Vec<usize>) {
    let recent_start = items.len().saturating_sub(policy.keep_recent);
    let mut kept = Vec::new();
    let mut summarizable = Vec::new();
    for (i, item) in items.iter().enumerate() {
        if i >= recent_start || item.is_critical() {
            kept.push(i);
        } else {
            summarizable.push(i);
        }
    }
    (kept, summarizable)
}

fn total_tokens(items: &[ContentItem]) -> u64 {
    items.iter().map(|i| u64::from(i.token_count)).sum()
}

/// Run one compaction pass.
///
/// On summarizer error this falls back to deterministically dropping the
/// lowest-importance summarizable items until the ratio target is met.
pub async fn compact(
    items: &[ContentItem],
    policy: &CompactionPolicy,
    summarizer: &dyn Summarizer,
    meter: &TokenMeter,
    model: &str,
) -> CompactionOutcome {
    let (kept, summarizable) = partition(items, policy);
    if summarizable.is_empty() {
        return CompactionOutcome::Rejected {
            reason: RejectReason::NothingToCompact,
        };
    }

    let tokens_before = total_tokens(items);
    let to_summarize: Vec<ContentItem> = summarizable.iter().map(|&i| items[i].clone()).collect();
    let summarized_tokens = total_tokens(&to_summarize);

    match summarizer.summarize(&to_summarize).await {
        Ok(summary_text) => {
            let summary_text = summary_text.trim().to_string();
            if policy
                .refusal_phrases
                .iter()
                .any(|phrase| summary_text.to_lowercase().contains(&phrase.to_lowercase()))
            {
                debug!("Compaction summary matched a refusal phrase");
                return CompactionOutcome::Rejected {
                    reason: RejectReason::Refusal,
                };
            }
            if summary_text.chars().count() < policy.min_summary_chars {
                return CompactionOutcome::Rejected {
                    reason: RejectReason::SummaryTooShort,
                };
            }

            let summary_tokens = meter.estimate(&summary_text, model).tokens;
            if f64::from(summary_tokens) >= summarized_tokens as f64 * policy.summary_ratio {
                return CompactionOutcome::Rejected {
                    reason: RejectReason::SummaryTooLarge,
                };
            }

            let mut result: Vec<ContentItem> =
                kept.iter().map(|&i| items[i].clone()).collect();
            result.insert(0, ContentItem::new(ContentKind::Summary, &summary_text, summary_tokens));

            let tokens_after = total_tokens(&result);
            let reduction = 1.0 - (tokens_after as f64 / tokens_before.max(1) as f64);
            if reduction < policy.min_reduction {
                return CompactionOutcome::Rejected {
                    reason: RejectReason::InsufficientReduction,
                };
            }

            CompactionOutcome::Accepted {
                items: result,
                tokens_before,
                tokens_after,
            }
        }
        Err(err) => {
            warn!(error = %err, "Summarizer failed, falling back to basic compaction");
            basic_compact(items, policy, &summarizable, tokens_before, summarized_tokens)
        }
    }
}

/// Deterministic fallback: drop lowest-importance summarizable items until
/// the remaining summarizable share is under the ratio target.
fn basic_compact(
    items: &[ContentItem],
    policy: &CompactionPolicy,
    summarizable: &[usize],
    tokens_before: u64,
    summarized_tokens: u64,
) -> CompactionOutcome {
    let target = (summarized_tokens as f64 * policy.summary_ratio) as u64;

    let mut by_importance: Vec<usize> = summarizable.to_vec();
    by_importance.sort_by(|&a, &b| {
        items[a]
            .importance()
            .partial_cmp(&items[b].importance())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.cmp(&b))
    });

    let mut remaining = summarized_tokens;
    let mut dropped: std::collections::HashSet<usize> = std::collections::HashSet::new();
    for idx in by_importance {
        if remaining <= target {
            break;
        }
        remaining = remaining.saturating_sub(u64::from(items[idx].token_count));
        dropped.insert(idx);
    }

    if remaining > target {
        return CompactionOutcome::Degraded {
            reason: "basic compaction could not reach the reduction target".into(),
        };
    }

    // Every index is either kept or summarizable, so the survivors are
    // simply the non-dropped items.
    let result: Vec<ContentItem> = items
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, item)| item.clone())
        .collect();

    let tokens_after = total_tokens(&result);
    let reduction = 1.0 - (tokens_after as f64 / tokens_before.max(1) as f64);
    if reduction < policy.min_reduction {
        return CompactionOutcome::Degraded {
            reason: "basic compaction reduced by less than the minimum".into(),
        };
    }

    CompactionOutcome::Accepted {
        items: result,
        tokens_before,
        tokens_after,
    }
}
