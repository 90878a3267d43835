//! Phased task orchestration.
//!
//! [`engine::Orchestrator`] owns the state machine (Planning → Scouting →
//! Architecting → Building → Validating, with bounded Healing loops);
//! [`runner::PhaseRunner`] drives each LLM-backed phase through the shared
//! compaction/cache/budget sequence. Fan-out phases dispatch through
//! [`crate::pool`] and the build dependency graph lives in [`crate::dag`].

pub mod engine;
pub mod runner;

pub use engine::{
    Collaborators, ExitStatus, Orchestrator, RunOutcome, StatusReport, VersionControlSink,
};
pub use runner::{PhaseCall, PhaseOutcome, PhaseRunner};
