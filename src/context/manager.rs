//! Per-conversation content tracking and compaction control.
//!
//! The manager owns one logical conversation's items. It meters and scores
//! everything tracked, decides when to compact, and enforces the emergency
//! stop. Workers never share a manager; they get snapshot views and the
//! parent reconciles their returned summaries.

use crate::budget::TokenMeter;
use crate::context::compactor::{self, CompactionOutcome, CompactionPolicy, Summarizer};
use crate::context::item::{ContentItem, ContentKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Usage metrics returned from `track`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextMetrics {
    pub total_tokens: u64,
    pub usage_pct: f64,
    pub item_count: usize,
}

/// Tracks content for one conversation and drives compaction.
#[derive(Debug, Clone)]
pub struct ContextManager {
    items: Vec<ContentItem>,
    meter: TokenMeter,
    model: String,
    /// Token envelope this conversation may occupy.
    budget_tokens: u64,
    policy: CompactionPolicy,
    /// Standard compaction trigger percentage.
    threshold_pct: f64,
    /// Forced compaction percentage; fires even after a recent attempt.
    forced_pct: f64,
    /// Emergency stop percentage.
    emergency_pct: f64,
    /// Whether a compaction ran since usage last dropped below threshold.
    attempted_at_threshold: bool,
    consecutive_failures: u32,
    completed_compactions: u32,
}

impl ContextManager {
    pub fn new(
        meter: TokenMeter,
        model: &str,
        budget_tokens: u64,
        policy: CompactionPolicy,
        threshold_pct: f64,
        forced_pct: f64,
        emergency_pct: f64,
    ) -> Self {
        Self {
            items: Vec::new(),
            meter,
            model: model.to_string(),
            budget_tokens,
            policy,
            threshold_pct,
            forced_pct,
            emergency_pct,
            attempted_at_threshold: false,
            consecutive_failures: 0,
            completed_compactions: 0,
        }
    }

    /// Manager with the standard thresholds (40 / 70 / 80).
    pub fn with_defaults(meter: TokenMeter, model: &str, budget_tokens: u64) -> Self {
        Self::new(
            meter,
            model,
            budget_tokens,
            CompactionPolicy::default(),
            crate::config::DEFAULT_COMPACTION_THRESHOLD_PCT,
            crate::config::FORCED_COMPACTION_PCT,
            crate::config::DEFAULT_EMERGENCY_STOP_PCT,
        )
    }

    /// Track one piece of content, metering and scoring it.
    pub fn track(
        &mut self,
        kind: ContentKind,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> ContextMetrics {
        let tokens = self.meter.estimate(text, &self.model).tokens;
        let item = ContentItem::new(kind, text, tokens).with_metadata(metadata);
        self.items.push(item);

        if self.usage_pct() < self.threshold_pct {
            self.attempted_at_threshold = false;
        }
        self.metrics()
    }

    /// Current metrics.
    pub fn metrics(&self) -> ContextMetrics {
        ContextMetrics {
            total_tokens: self.total_tokens(),
            usage_pct: self.usage_pct(),
            item_count: self.items.len(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.token_count)).sum()
    }

    pub fn usage_pct(&self) -> f64 {
        if self.budget_tokens == 0 {
            return 100.0;
        }
        (self.total_tokens() as f64 / self.budget_tokens as f64) * 100.0
    }

    /// All tracked items.
    pub fn items(&self) -> &[ContentItem] {
        &self.items
    }

    /// Snapshot view for a worker or checkpoint: critical items plus the
    /// most recent `keep_recent`, in original order.
    pub fn snapshot(&self) -> Vec<ContentItem> {
        let recent_start = self.items.len().saturating_sub(self.policy.keep_recent);
        self.items
            .iter()
            .enumerate()
            .filter(|(i, item)| *i >= recent_start || item.is_critical())
            .map(|(_, item)| item.clone())
            .collect()
    }

    /// Restore tracked items from a checkpoint snapshot.
    pub fn restore(&mut self, items: Vec<ContentItem>) {
        self.items = items;
        self.attempted_at_threshold = false;
        self.consecutive_failures = 0;
    }

    /// Decide whether to compact at the given usage percentage.
    ///
    /// Standard trigger at the threshold (default 40%) unless an attempt
    /// already ran at this level; forced trigger at 70% regardless.
    pub fn should_compact_at(&self, usage_pct: f64) -> bool {
        if usage_pct >= self.forced_pct {
            return true;
        }
        usage_pct >= self.threshold_pct && !self.attempted_at_threshold
    }

    /// Decide whether to compact at current usage.
    pub fn should_compact(&self) -> bool {
        self.should_compact_at(self.usage_pct())
    }

    /// Run one compaction pass through the pure compactor.
    ///
    /// Accepted passes replace the item list and reset the failure counter;
    /// rejected or degraded passes count as consecutive failures. The caller
    /// records failures in the ledger and emits events.
    pub async fn compact(&mut self, summarizer: &dyn Summarizer) -> CompactionOutcome {
        self.attempted_at_threshold = true;
        let outcome = compactor::compact(
            &self.items,
            &self.policy,
            summarizer,
            &self.meter,
            &self.model,
        )
        .await;

        match &outcome {
            CompactionOutcome::Accepted {
                items,
                tokens_before,
                tokens_after,
            } => {
                info!(
                    tokens_before,
                    tokens_after,
                    items = items.len(),
                    "Compaction accepted"
                );
                self.items = items.clone();
                self.consecutive_failures = 0;
                self.completed_compactions += 1;
            }
            CompactionOutcome::Rejected { reason } => {
                debug!(?reason, "Compaction rejected");
                self.consecutive_failures += 1;
            }
            CompactionOutcome::Degraded { reason } => {
                debug!(reason, "Compaction degraded");
                self.consecutive_failures += 1;
            }
        }
        outcome
    }

    /// Emergency stop check: usage at/over the stop percentage, or two
    /// consecutive failed compactions.
    pub fn should_emergency_stop(&self) -> (bool, Option<String>) {
        let usage = self.usage_pct();
        if usage >= self.emergency_pct {
            return (
                true,
                Some(format!(
                    "context usage at {usage:.1}% of the {}-token envelope",
                    self.budget_tokens
                )),
            );
        }
        if self.consecutive_failures >= 2 {
            return (
                true,
                Some(format!(
                    "{} consecutive compactions failed to reduce context",
                    self.consecutive_failures
                )),
            );
        }
        (false, None)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn completed_compactions(&self) -> u32 {
        self.completed_compactions
    }
}
