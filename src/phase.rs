//! Phase identity, status, and the per-task token ledger.
//!
//! `PhaseId` is a closed tag set so phase-keyed maps can be matched
//! exhaustively. The budget-only phases (`System`, `Documentation`, `Deploy`,
//! `Feedback`) receive allocations but are never state-machine states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifies a phase for budgeting, caching, and state tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Planning,
    Scouting,
    Architecting,
    Building,
    Validating,
    Healing,
    Documentation,
    Deploy,
    Feedback,
    System,
}

impl PhaseId {
    /// Phases the orchestrator state machine actually runs, in order.
    pub const RUN_ORDER: [PhaseId; 5] = [
        PhaseId::Planning,
        PhaseId::Scouting,
        PhaseId::Architecting,
        PhaseId::Building,
        PhaseId::Validating,
    ];

    /// All phases that receive a budget allocation.
    pub const ALL: [PhaseId; 10] = [
        PhaseId::Planning,
        PhaseId::Scouting,
        PhaseId::Architecting,
        PhaseId::Building,
        PhaseId::Validating,
        PhaseId::Healing,
        PhaseId::Documentation,
        PhaseId::Deploy,
        PhaseId::Feedback,
        PhaseId::System,
    ];

    /// Stable name used in cache keys, event payloads, and file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Planning => "planning",
            PhaseId::Scouting => "scouting",
            PhaseId::Architecting => "architecting",
            PhaseId::Building => "building",
            PhaseId::Validating => "validating",
            PhaseId::Healing => "healing",
            PhaseId::Documentation => "documentation",
            PhaseId::Deploy => "deploy",
            PhaseId::Feedback => "feedback",
            PhaseId::System => "system",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a phase within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Phase has not started.
    #[default]
    Pending,
    /// Phase is currently running.
    Running,
    /// Phase ran a compaction pass and continued.
    Compacted,
    /// Phase completed successfully.
    Succeeded,
    /// Phase failed. Recoverable failures can be resumed.
    Failed { recoverable: bool },
    /// Phase was skipped (cache hit or dependency failure).
    Skipped,
}

impl PhaseStatus {
    /// Check if the phase is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Skipped
        )
    }

    /// Check if the phase completed successfully or was legitimately skipped.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

/// Recorded state of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase_id: PhaseId,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Content items visible when the phase started.
    pub items_in: usize,
    /// Content items visible when the phase ended.
    pub items_out: usize,
    /// Tokens spent by this phase.
    pub ledger: LedgerSlice,
}

impl PhaseState {
    pub fn pending(phase_id: PhaseId) -> Self {
        Self {
            phase_id,
            status: PhaseStatus::Pending,
            started_at: None,
            ended_at: None,
            items_in: 0,
            items_out: 0,
            ledger: LedgerSlice::default(),
        }
    }

    /// Mark the phase as running, stamping the start time.
    pub fn start(&mut self) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Mark the phase as finished with the given status.
    pub fn finish(&mut self, status: PhaseStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// Token and cost totals for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerSlice {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in minor currency units (e.g. hundredths of a cent).
    pub cost_minor: u64,
    /// LLM calls recorded against this phase.
    pub calls: u32,
    /// Compaction attempts that failed to reduce tokens.
    pub failed_compactions: u32,
}

impl LedgerSlice {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-task token accounting, split by phase.
///
/// Updates are commutative sums, so callers only need atomicity of `add`;
/// the orchestrator wraps the ledger in a mutex held for the update alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenLedger {
    phases: HashMap<PhaseId, LedgerSlice>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one LLM call against a phase.
    pub fn add(&mut self, phase: PhaseId, input_tokens: u64, output_tokens: u64, cost_minor: u64) {
        let slice = self.phases.entry(phase).or_default();
        slice.input_tokens += input_tokens;
        slice.output_tokens += output_tokens;
        slice.cost_minor += cost_minor;
        slice.calls += 1;
    }

    /// Record a compaction attempt that failed to reduce tokens.
    pub fn add_failed_compaction(&mut self, phase: PhaseId) {
        self.phases.entry(phase).or_default().failed_compactions += 1;
    }

    /// Totals for one phase.
    pub fn phase(&self, phase: PhaseId) -> LedgerSlice {
        self.phases.get(&phase).copied().unwrap_or_default()
    }

    /// Totals across all phases.
    pub fn total(&self) -> LedgerSlice {
        let mut total = LedgerSlice::default();
        for slice in self.phases.values() {
            total.input_tokens += slice.input_tokens;
            total.output_tokens += slice.output_tokens;
            total.cost_minor += slice.cost_minor;
            total.calls += slice.calls;
            total.failed_compactions += slice.failed_compactions;
        }
        total
    }
}
