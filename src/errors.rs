//! Typed error hierarchy for the Foundry orchestrator.
//!
//! Four top-level enums cover the subsystems:
//! - `ConfigError` — invalid options or missing credentials; always fatal
//! - `ProviderError` — LLM call failures, split transient vs. permanent
//! - `PhaseError` — per-phase execution failures
//! - `OrchestratorError` — task-level failures and terminal outcomes

use std::path::PathBuf;
use thiserror::Error;

/// Errors from option validation. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for option '{option}': {message}")]
    InvalidOption { option: String, message: String },

    #[error("Unknown budget profile '{0}'")]
    UnknownProfile(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Errors from an LLM provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Provider returned server error {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request rejected: {0}")]
    InvalidRequest(String),

    #[error("Unsupported model '{0}'")]
    UnsupportedModel(String),
}

impl ProviderError {
    /// Transient errors are safe to retry with backoff; permanent errors
    /// fail the current call immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Network(_)
        )
    }
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Budget exceeded for phase {phase}: used {used} of {allocated} tokens")]
    BudgetExceeded {
        phase: String,
        used: u64,
        allocated: u64,
    },

    #[error("Emergency stop: {reason}")]
    EmergencyStop { reason: String },

    #[error("Provider call failed after {attempts} attempts: {source}")]
    ProviderExhausted {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Validation failed: {failing:?} below threshold")]
    ValidationFailed { failing: Vec<String> },

    #[error("Worker pool below minimum success: {succeeded}/{total}")]
    MinimumSuccessNotMet { succeeded: usize, total: usize },

    #[error("Phase cancelled")]
    Cancelled,

    #[error("Phase deadline exceeded")]
    DeadlineExceeded,
}

impl PhaseError {
    /// Recoverable failures leave a checkpoint a later `resume` can pick up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::EmergencyStop { .. } | Self::Cancelled | Self::DeadlineExceeded
        )
    }
}

/// Errors from the orchestrator itself.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No checkpoint found for task {0}")]
    NoCheckpoint(String),

    #[error("Checkpoint at {path} could not be read: {message}")]
    CheckpointCorrupt { path: PathBuf, message: String },

    #[error("Planning produced no plan: {0}")]
    PlanningFailed(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: PhaseError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
