//! Conversation content tracking, scoring, and compaction.
//!
//! ## Structure
//!
//! - [`item`] — `ContentItem` and importance scoring
//! - [`compactor`] — the pure compaction pass with its acceptance gates
//! - [`manager`] — per-conversation tracking, triggers, emergency stop
//!
//! The compactor is a pure function of its inputs; the manager drives it and
//! owns all state. Workers receive snapshot views, never the manager itself.

pub mod compactor;
pub mod item;
pub mod manager;

pub use compactor::{CompactionOutcome, CompactionPolicy, RejectReason, Summarizer};
pub use item::{ContentItem, ContentKind};
pub use manager::{ContextManager, ContextMetrics};
