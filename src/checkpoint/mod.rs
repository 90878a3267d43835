//! Durable orchestrator snapshots for crash-safe resumption.
//!
//! One checkpoint file per task, written atomically after every successful
//! phase transition. Loading the most recent complete checkpoint plus the
//! event log reproduces the orchestrator state under at-least-once
//! semantics: a crash between transition and write may re-run a phase, and
//! consumers de-duplicate events by `seq`.

use crate::context::ContentItem;
use crate::phase::{PhaseId, PhaseState, TokenLedger};
use crate::task::{Plan, Task, TaskId};
use crate::validator::FixTask;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// The next action a resumed orchestrator takes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Cursor {
    /// Run the named phase next.
    RunPhase { phase: PhaseId },
    /// Task finished successfully.
    Completed,
    /// Task failed terminally.
    Failed { reason: String },
}

/// A durable snapshot of orchestrator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task: Task,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub phase_states: Vec<PhaseState>,
    /// Kept context items only; the full history is not persisted.
    pub context_snapshot: Vec<ContentItem>,
    pub ledger: TokenLedger,
    pub cursor: Cursor,
    /// Build task ids that already succeeded; never re-run on resume.
    #[serde(default)]
    pub completed_build_tasks: Vec<String>,
    /// Healing rounds consumed so far.
    #[serde(default)]
    pub heal_attempts: u32,
    /// Fix tasks from the last failed validation, consumed by healing.
    #[serde(default)]
    pub pending_fixes: Vec<FixTask>,
    /// Compressed scout aggregate feeding the architect phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scout_summary: Option<String>,
    /// Per-prompt output envelope override set after an emergency stop.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_envelope: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Fresh checkpoint for a task about to start planning.
    pub fn initial(task: Task) -> Self {
        Self {
            task,
            plan: None,
            phase_states: Vec::new(),
            context_snapshot: Vec::new(),
            ledger: TokenLedger::new(),
            cursor: Cursor::RunPhase {
                phase: PhaseId::Planning,
            },
            completed_build_tasks: Vec::new(),
            heal_attempts: 0,
            pending_fixes: Vec::new(),
            scout_summary: None,
            output_envelope: None,
            updated_at: Utc::now(),
        }
    }

    /// State record for a phase, if one was written.
    pub fn phase_state(&self, phase: PhaseId) -> Option<&PhaseState> {
        self.phase_states.iter().find(|s| s.phase_id == phase)
    }

    /// Insert or replace a phase state record.
    pub fn record_phase(&mut self, state: PhaseState) {
        if let Some(existing) = self
            .phase_states
            .iter_mut()
            .find(|s| s.phase_id == state.phase_id)
        {
            *existing = state;
        } else {
            self.phase_states.push(state);
        }
    }
}

/// File-backed checkpoint persistence.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open a store rooted at the given directory, creating it if needed.
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoint directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(format!("{task_id}.json"))
    }

    /// Persist a checkpoint atomically (write-to-temp + rename). Partial
    /// checkpoints are never observable.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.updated_at = Utc::now();

        let path = self.path_for(&checkpoint.task.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&checkpoint).context("Failed to encode checkpoint")?;
        fs::write(&tmp, &json)
            .with_context(|| format!("Failed to write checkpoint temp file {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to move checkpoint into place at {}", path.display()))?;
        Ok(())
    }

    /// Load the checkpoint for a task, or `None` when none exists. An
    /// unreadable checkpoint is reported as absent after a warning; the
    /// caller decides whether to start over.
    pub fn load(&self, task_id: &TaskId) -> Option<Checkpoint> {
        let path = self.path_for(task_id);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Checkpoint unreadable");
                None
            }
        }
    }

    /// Ids of every task with a stored checkpoint, sorted for determinism.
    pub fn list(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = match fs::read_dir(&self.root) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|entry| {
                    let name = entry.file_name().into_string().ok()?;
                    let id = name.strip_suffix(".json")?;
                    Some(TaskId::from(id))
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}
