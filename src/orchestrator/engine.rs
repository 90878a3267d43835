//! Top-level task state machine.
//!
//! Drives the fixed sequence Planning → Scouting → Architecting → Building
//! → Validating, with a bounded Healing → Building loop after failed
//! validation. Phases are sequential; scout and builder phases fan work out
//! through the worker pool. Every transition snapshots to the checkpoint
//! store and is observable on the event stream.
//!
//! ## Persistence ownership
//!
//! | Layer              | What it persists                                    |
//! |--------------------|-----------------------------------------------------|
//! | `CheckpointStore`  | Plan, phase states, ledger, context snapshot, cursor |
//! | `EventBus`         | Append-only observation log; never drives control    |
//! | `ArtifactCache`    | Phase artifacts keyed by normalized inputs           |
//!
//! The checkpoint is the source of truth for resumption: `resume` loads it
//! and continues from the cursor, re-running nothing that already succeeded.

use crate::budget::{BudgetMonitor, BudgetZone, TokenMeter};
use crate::cache::ArtifactCache;
use crate::checkpoint::{Checkpoint, CheckpointStore, Cursor};
use crate::config::{BudgetProfile, CacheScope, Options};
use crate::context::{ContentKind, ContextManager, Summarizer};
use crate::errors::{OrchestratorError, PhaseError};
use crate::events::{Event, EventBus, EventKind};
use crate::orchestrator::runner::{PhaseCall, PhaseRunner};
use crate::phase::{PhaseId, PhaseState, PhaseStatus, TokenLedger};
use crate::pool::{Job, JobOutput, WorkerPool, meets_minimum_success};
use crate::provider::{
    CompletionRequest, LlmProvider, Message, PricingOracle, ProviderClient, RetryPolicy,
};
use crate::task::{BuildTask, Plan, Task, TaskId};
use crate::validator::{
    FixTask, RubricScorer, Scores, TestRunner, ValidationReport, Validator,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Minimum success fraction for fan-out phases without dependency edges.
const DEFAULT_MINIMUM_SUCCESS: f64 = 0.6;

/// Default per-prompt output envelope in tokens.
const DEFAULT_OUTPUT_ENVELOPE: u64 = 8_192;

/// Optional sink for committing produced files.
pub trait VersionControlSink: Send + Sync {
    fn commit(&self, files: &[PathBuf], message: &str) -> anyhow::Result<()>;
}

/// External collaborators injected at task start. Lifecycle is tied to the
/// task, not the process, so concurrent tasks get independent state.
pub struct Collaborators {
    pub provider: Arc<dyn LlmProvider>,
    pub pricing: Arc<dyn PricingOracle>,
    pub fallback_pricing: Arc<dyn PricingOracle>,
    pub summarizer: Arc<dyn Summarizer>,
    pub scorer: Arc<dyn RubricScorer>,
    pub test_runner: Option<Arc<dyn TestRunner>>,
    pub vcs: Option<Arc<dyn VersionControlSink>>,
    pub meter: TokenMeter,
    /// Model every phase call targets.
    pub model: String,
}

/// Terminal outcome of a task run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitStatus {
    Completed,
    Failed { reason: String, recoverable: bool },
    Cancelled,
    DeadlineExceeded,
}

/// Result of driving a task to a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub task_id: TaskId,
    pub status: ExitStatus,
}

/// Snapshot answer for the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub phase: Option<PhaseId>,
    pub cursor: Cursor,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub cost_minor: u64,
    pub zone: Option<BudgetZone>,
    pub last_event_seq: Option<u64>,
}

/// Per-run mutable state threaded through the phase methods.
struct RunCtx {
    bus: Arc<EventBus>,
    runner: PhaseRunner,
    client: Arc<ProviderClient>,
    ledger: Arc<Mutex<TokenLedger>>,
    ctx: ContextManager,
    cancel: CancellationToken,
    deadline_fired: Arc<AtomicBool>,
}

impl RunCtx {
    fn envelope(&self, checkpoint: &Checkpoint) -> u64 {
        checkpoint.output_envelope.unwrap_or(DEFAULT_OUTPUT_ENVELOPE)
    }
}

/// The orchestrator: one instance drives one workspace.
pub struct Orchestrator {
    workspace: PathBuf,
    options: Options,
    collab: Collaborators,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Construct an orchestrator for a workspace, validating options up
    /// front. Fatal configuration problems surface here, never mid-run.
    pub fn new(
        workspace: PathBuf,
        options: Options,
        collab: Collaborators,
    ) -> Result<Self, OrchestratorError> {
        options.validate()?;
        BudgetProfile::named(&options.budget_profile)?;
        let checkpoints = CheckpointStore::open(workspace.join(".state/checkpoints"))?;
        Ok(Self {
            workspace,
            options,
            collab,
            checkpoints,
            cancel: CancellationToken::new(),
        })
    }

    /// Token for cooperative in-process cancellation.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn events_dir(&self) -> PathBuf {
        self.workspace.join(".state/events")
    }

    fn cancel_marker(&self, task_id: &TaskId) -> PathBuf {
        self.workspace.join(".state/cancel").join(task_id.as_str())
    }

    fn cache_root(&self) -> PathBuf {
        match self.options.incremental {
            CacheScope::Global => self
                .options
                .global_cache_dir
                .clone()
                .unwrap_or_else(|| self.workspace.join(".state/cache")),
            _ => self.workspace.join(".state/cache"),
        }
    }

    /// Start a fresh task from a description and drive it to a terminal
    /// state.
    pub async fn start(&self, description: &str) -> Result<RunOutcome, OrchestratorError> {
        let task = Task::new(description, self.workspace.clone(), self.options.clone());
        let checkpoint = Checkpoint::initial(task);
        self.checkpoints.save(&checkpoint)?;
        Ok(self.drive(checkpoint).await)
    }

    /// Resume a task from its checkpoint. Completed phases are not rerun.
    pub async fn resume(&self, task_id: &TaskId) -> Result<RunOutcome, OrchestratorError> {
        let checkpoint = self
            .checkpoints
            .load(task_id)
            .ok_or_else(|| OrchestratorError::NoCheckpoint(task_id.to_string()))?;
        // A stale cancel request must not immediately kill the resumed run.
        let _ = fs::remove_file(self.cancel_marker(task_id));
        Ok(self.drive(checkpoint).await)
    }

    /// Request cancellation of a task, in-process and across processes.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), OrchestratorError> {
        let marker = self.cancel_marker(task_id);
        if let Some(parent) = marker.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&marker, b"cancel")
            .with_context(|| format!("Failed to write cancel marker {}", marker.display()))?;
        self.cancel.cancel();
        Ok(())
    }

    /// Current status of a task from its checkpoint and event log.
    pub fn status(&self, task_id: &TaskId) -> Result<StatusReport, OrchestratorError> {
        let checkpoint = self
            .checkpoints
            .load(task_id)
            .ok_or_else(|| OrchestratorError::NoCheckpoint(task_id.to_string()))?;

        let phase = match &checkpoint.cursor {
            Cursor::RunPhase { phase } => Some(*phase),
            _ => None,
        };

        let monitor = BudgetMonitor::allocate(
            &BudgetProfile::named(&checkpoint.task.options.budget_profile)?,
            checkpoint.task.options.context_window,
        );
        let zone = phase.map(|p| {
            monitor
                .check(p, checkpoint.ledger.phase(p).total_tokens())
                .zone
        });

        let bus = EventBus::open(&self.events_dir(), task_id.clone())?;
        let last_event_seq = bus.replay(0)?.last().map(|e| e.seq);

        let total = checkpoint.ledger.total();
        Ok(StatusReport {
            phase,
            cursor: checkpoint.cursor,
            total_input_tokens: total.input_tokens,
            total_output_tokens: total.output_tokens,
            cost_minor: total.cost_minor,
            zone,
            last_event_seq,
        })
    }

    /// Replay a task's events from a sequence number.
    pub fn events(&self, task_id: &TaskId, from_seq: u64) -> Result<Vec<Event>, OrchestratorError> {
        let bus = EventBus::open(&self.events_dir(), task_id.clone())?;
        Ok(bus.replay(from_seq)?)
    }

    /// Tasks with stored checkpoints.
    pub fn list(&self) -> Vec<TaskId> {
        self.checkpoints.list()
    }

    /// Remove expired cache entries.
    pub fn sweep_cache(&self) -> crate::cache::SweepReport {
        ArtifactCache::open(self.cache_root()).sweep()
    }

    fn build_run_ctx(&self, checkpoint: &Checkpoint) -> Result<RunCtx, OrchestratorError> {
        let bus = Arc::new(EventBus::open(
            &self.events_dir(),
            checkpoint.task.id.clone(),
        )?);

        let client = Arc::new(ProviderClient::new(
            Arc::clone(&self.collab.provider),
            Arc::clone(&self.collab.pricing),
            Arc::clone(&self.collab.fallback_pricing),
            self.collab.meter.clone(),
            RetryPolicy::default().with_max_attempts(self.options.provider_retries.max(1)),
        ));

        let monitor = BudgetMonitor::allocate(
            &BudgetProfile::named(&self.options.budget_profile)?,
            self.options.context_window,
        );

        let runner = PhaseRunner::new(
            Arc::clone(&client),
            ArtifactCache::open(self.cache_root()),
            self.options.incremental,
            monitor,
            Arc::clone(&self.collab.summarizer),
            self.options.artifact_ttl,
        );

        let mut ctx = ContextManager::new(
            self.collab.meter.clone(),
            &self.collab.model,
            self.options.context_window,
            Default::default(),
            self.options.compaction_threshold_pct,
            crate::config::FORCED_COMPACTION_PCT,
            self.options.emergency_stop_pct,
        );
        ctx.restore(checkpoint.context_snapshot.clone());

        let cancel = self.cancel.child_token();
        let deadline_fired = Arc::new(AtomicBool::new(false));
        if let Some(deadline) = self.options.deadline {
            let elapsed = chrono::Utc::now()
                .signed_duration_since(checkpoint.task.created_at)
                .to_std()
                .unwrap_or_default();
            let remaining = deadline.saturating_sub(elapsed);
            let fired = Arc::clone(&deadline_fired);
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(remaining).await;
                fired.store(true, Ordering::SeqCst);
                token.cancel();
            });
        }

        Ok(RunCtx {
            bus,
            runner,
            client,
            ledger: Arc::new(Mutex::new(checkpoint.ledger.clone())),
            ctx,
            cancel,
            deadline_fired,
        })
    }

    /// Drive a checkpoint to a terminal state.
    async fn drive(&self, mut checkpoint: Checkpoint) -> RunOutcome {
        let task_id = checkpoint.task.id.clone();
        let mut rc = match self.build_run_ctx(&checkpoint) {
            Ok(rc) => rc,
            Err(err) => {
                return RunOutcome {
                    task_id,
                    status: ExitStatus::Failed {
                        reason: err.to_string(),
                        recoverable: false,
                    },
                };
            }
        };

        loop {
            if rc.cancel.is_cancelled() || self.cancel_marker(&task_id).exists() {
                return self.finish_interrupted(&mut checkpoint, &rc).await;
            }

            let phase = match checkpoint.cursor.clone() {
                Cursor::RunPhase { phase } => phase,
                Cursor::Completed => {
                    return RunOutcome {
                        task_id,
                        status: ExitStatus::Completed,
                    };
                }
                Cursor::Failed { reason } => {
                    return RunOutcome {
                        task_id,
                        status: ExitStatus::Failed {
                            reason,
                            recoverable: false,
                        },
                    };
                }
            };

            info!(task = %task_id, %phase, "Entering phase");
            let result = match phase {
                PhaseId::Planning => self.run_planning(&mut checkpoint, &mut rc).await,
                PhaseId::Scouting => self.run_scouting(&mut checkpoint, &mut rc).await,
                PhaseId::Architecting => self.run_architecting(&mut checkpoint, &mut rc).await,
                PhaseId::Building => self.run_building(&mut checkpoint, &mut rc).await,
                PhaseId::Validating => self.run_validating(&mut checkpoint, &mut rc).await,
                PhaseId::Healing => self.run_healing(&mut checkpoint, &mut rc).await,
                other => {
                    warn!(phase = %other, "Cursor points at a non-runnable phase");
                    Ok(Cursor::Failed {
                        reason: format!("cursor points at non-runnable phase {other}"),
                    })
                }
            };

            match result {
                Ok(next) => {
                    checkpoint.cursor = next;
                    checkpoint.context_snapshot = rc.ctx.snapshot();
                    checkpoint.ledger = rc.ledger.lock().expect("ledger lock poisoned").clone();
                    if let Err(err) = self.checkpoints.save(&checkpoint) {
                        warn!(error = %err, "Checkpoint write failed");
                        let _ = rc
                            .bus
                            .emit(
                                EventKind::Log,
                                Some(phase),
                                json!({"level": "warn", "message": format!("checkpoint write failed: {err}")}),
                            )
                            .await;
                    }
                    if matches!(checkpoint.cursor, Cursor::Completed) {
                        let _ = rc
                            .bus
                            .emit(EventKind::Completion, None, json!({"status": "ok"}))
                            .await;
                    }
                    if let Cursor::Failed { reason } = &checkpoint.cursor {
                        let _ = rc
                            .bus
                            .emit(
                                EventKind::Completion,
                                None,
                                json!({"status": "failed", "reason": reason}),
                            )
                            .await;
                    }
                }
                Err(err) if matches!(err, PhaseError::Cancelled | PhaseError::DeadlineExceeded) => {
                    return self.finish_interrupted(&mut checkpoint, &rc).await;
                }
                Err(err) => {
                    return self.finish_phase_failure(&mut checkpoint, &rc, phase, err).await;
                }
            }
        }
    }

    /// Record a cancellation or deadline exit, leaving the checkpoint at
    /// the interrupted phase so `resume` can pick it back up.
    async fn finish_interrupted(&self, checkpoint: &mut Checkpoint, rc: &RunCtx) -> RunOutcome {
        let deadline = rc.deadline_fired.load(Ordering::SeqCst);
        let status = if deadline {
            ExitStatus::DeadlineExceeded
        } else {
            ExitStatus::Cancelled
        };
        checkpoint.context_snapshot = rc.ctx.snapshot();
        checkpoint.ledger = rc.ledger.lock().expect("ledger lock poisoned").clone();
        if let Err(err) = self.checkpoints.save(checkpoint) {
            warn!(error = %err, "Checkpoint write failed during shutdown");
        }
        let kind = if deadline { "deadline_exceeded" } else { "cancelled" };
        let _ = rc
            .bus
            .emit(EventKind::Completion, None, json!({"status": kind}))
            .await;
        RunOutcome {
            task_id: checkpoint.task.id.clone(),
            status,
        }
    }

    /// Record a phase failure. Recoverable failures keep the cursor on the
    /// failed phase (with a lowered output envelope after an emergency
    /// stop); unrecoverable ones mark the task failed.
    async fn finish_phase_failure(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &RunCtx,
        phase: PhaseId,
        err: PhaseError,
    ) -> RunOutcome {
        let recoverable = err.is_recoverable();
        let mut state = checkpoint
            .phase_state(phase)
            .cloned()
            .unwrap_or_else(|| PhaseState::pending(phase));
        state.finish(PhaseStatus::Failed { recoverable });
        checkpoint.record_phase(state);

        if matches!(err, PhaseError::EmergencyStop { .. }) {
            let current = checkpoint.output_envelope.unwrap_or(DEFAULT_OUTPUT_ENVELOPE);
            checkpoint.output_envelope = Some((current / 2).max(1_024));
        }
        if !recoverable {
            checkpoint.cursor = Cursor::Failed {
                reason: err.to_string(),
            };
        }
        checkpoint.context_snapshot = rc.ctx.snapshot();
        checkpoint.ledger = rc.ledger.lock().expect("ledger lock poisoned").clone();
        if let Err(save_err) = self.checkpoints.save(checkpoint) {
            warn!(error = %save_err, "Checkpoint write failed after phase failure");
        }

        let _ = rc
            .bus
            .emit(
                EventKind::PhaseChange,
                Some(phase),
                json!({"status": "failed", "recoverable": recoverable, "reason": err.to_string()}),
            )
            .await;
        let _ = rc
            .bus
            .emit(
                EventKind::Completion,
                None,
                json!({"status": "failed", "recoverable": recoverable, "reason": err.to_string()}),
            )
            .await;

        RunOutcome {
            task_id: checkpoint.task.id.clone(),
            status: ExitStatus::Failed {
                reason: err.to_string(),
                recoverable,
            },
        }
    }

    // --- Planning ---

    async fn run_planning(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        let mut state = PhaseState::pending(PhaseId::Planning);
        state.start();
        state.items_in = rc.ctx.items().len();

        let description = checkpoint.task.description.clone();
        rc.ctx
            .track(ContentKind::User, &description, Default::default());

        let request = CompletionRequest::new(
            &self.collab.model,
            vec![
                Message::system(planning_system_prompt()),
                Message::user(&description),
            ],
            rc.envelope(checkpoint),
        )
        .with_metadata("phase", PhaseId::Planning.as_str());

        let outcome = rc
            .runner
            .run(
                PhaseCall {
                    phase: PhaseId::Planning,
                    cache_inputs: format!("plan\n{description}"),
                    request,
                    cacheable: true,
                },
                &mut rc.ctx,
                &rc.ledger,
                &rc.bus,
                &rc.cancel,
            )
            .await?;

        let mut plan: Plan = match parse_json_payload(&outcome.text) {
            Some(plan) => plan,
            None => {
                state.finish(PhaseStatus::Failed { recoverable: false });
                checkpoint.record_phase(state);
                return Ok(Cursor::Failed {
                    reason: "planning response was not a parsable plan".to_string(),
                });
            }
        };
        plan.dedup_topics();
        if let Err(err) = plan.validate() {
            state.finish(PhaseStatus::Failed { recoverable: false });
            checkpoint.record_phase(state);
            return Ok(Cursor::Failed {
                reason: err.to_string(),
            });
        }

        rc.ctx.track(
            ContentKind::Decision,
            &format!(
                "Plan: {} scout topics, {} build tasks",
                plan.topics.len(),
                plan.build_tasks.len()
            ),
            Default::default(),
        );

        state.items_out = rc.ctx.items().len();
        state.finish(PhaseStatus::Succeeded);
        checkpoint.record_phase(state);
        checkpoint.plan = Some(plan);

        if !outcome.cache_hit {
            let _ = rc
                .bus
                .emit(
                    EventKind::PhaseChange,
                    Some(PhaseId::Planning),
                    json!({"status": "succeeded"}),
                )
                .await;
        }
        Ok(Cursor::RunPhase {
            phase: PhaseId::Scouting,
        })
    }

    // --- Scouting ---

    async fn run_scouting(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        let plan = checkpoint.plan.clone().ok_or_else(|| PhaseError::Provider(
            crate::errors::ProviderError::InvalidRequest("scouting without a plan".into()),
        ))?;

        if plan.topics.is_empty() {
            let mut state = PhaseState::pending(PhaseId::Scouting);
            state.finish(PhaseStatus::Skipped);
            checkpoint.record_phase(state);
            return Ok(Cursor::RunPhase {
                phase: PhaseId::Architecting,
            });
        }

        let mut state = PhaseState::pending(PhaseId::Scouting);
        state.start();
        state.items_in = rc.ctx.items().len();

        let snapshot_text = context_digest(&rc.ctx);
        let envelope = rc.envelope(checkpoint);
        let jobs: Vec<Job> = plan
            .topics
            .iter()
            .map(|topic| {
                let bus = Arc::clone(&rc.bus);
                let client = Arc::clone(&rc.client);
                let ledger = Arc::clone(&rc.ledger);
                let model = self.collab.model.clone();
                let prompt = format!(
                    "Research the following topic for an upcoming build.\n\
                     Topic: {}\n{}\n\nContext:\n{}",
                    topic.title, topic.prompt, snapshot_text
                );
                let job_id = format!("scout:{}", topic.title);
                Job::new(&job_id.clone(), move |cancel| {
                    Box::pin(async move {
                        let _ = bus
                            .emit(
                                EventKind::WorkerStarted,
                                Some(PhaseId::Scouting),
                                json!({"worker": job_id}),
                            )
                            .await;
                        let request =
                            CompletionRequest::new(&model, vec![Message::user(&prompt)], envelope);
                        match client.complete(&request, &cancel).await {
                            Ok(call) => {
                                ledger.lock().expect("ledger lock poisoned").add(
                                    PhaseId::Scouting,
                                    call.input_tokens,
                                    call.output_tokens,
                                    call.cost_minor,
                                );
                                let _ = bus
                                    .emit(
                                        EventKind::WorkerCompleted,
                                        Some(PhaseId::Scouting),
                                        json!({"worker": job_id, "tokens": call.total_tokens()}),
                                    )
                                    .await;
                                Ok(JobOutput {
                                    tokens: call.total_tokens(),
                                    text: call.text,
                                })
                            }
                            Err(err) => {
                                let _ = bus
                                    .emit(
                                        EventKind::WorkerFailed,
                                        Some(PhaseId::Scouting),
                                        json!({"worker": job_id, "error": err.to_string()}),
                                    )
                                    .await;
                                Err(err.to_string())
                            }
                        }
                    })
                })
            })
            .collect();

        let pool = WorkerPool::new(self.options.max_parallel_scouts);
        let results = pool.run(jobs, &rc.cancel, None).await;

        if rc.cancel.is_cancelled() {
            return Err(PhaseError::Cancelled);
        }
        if !meets_minimum_success(&results, DEFAULT_MINIMUM_SUCCESS) {
            return Err(PhaseError::MinimumSuccessNotMet {
                succeeded: results.iter().filter(|r| r.is_ok()).count(),
                total: results.len(),
            });
        }

        let outputs: Vec<String> = results
            .iter()
            .filter_map(|r| r.output.as_ref().map(|o| o.text.clone()))
            .collect();
        let summary = self
            .compress_scout_outputs(&outputs, &self.collab.model)
            .await;
        rc.ctx
            .track(ContentKind::Summary, &summary, Default::default());
        checkpoint.scout_summary = Some(summary);

        self.emit_budget_state(rc, PhaseId::Scouting).await;

        state.items_out = rc.ctx.items().len();
        state.finish(PhaseStatus::Succeeded);
        checkpoint.record_phase(state);

        let _ = rc
            .bus
            .emit(
                EventKind::PhaseChange,
                Some(PhaseId::Scouting),
                json!({"status": "succeeded", "workers": results.len()}),
            )
            .await;
        Ok(Cursor::RunPhase {
            phase: PhaseId::Architecting,
        })
    }

    /// Compress merged scout output to at most 25% of its raw token count.
    /// The summarizer does the semantic work; a deterministic truncation
    /// enforces the bound when it overshoots.
    async fn compress_scout_outputs(&self, outputs: &[String], model: &str) -> String {
        let meter = &self.collab.meter;
        let raw_tokens: u64 = outputs
            .iter()
            .map(|o| u64::from(meter.estimate(o, model).tokens))
            .sum();
        let budget = (raw_tokens / 4).max(1) as u32;

        let items: Vec<crate::context::ContentItem> = outputs
            .iter()
            .map(|o| {
                crate::context::ContentItem::new(
                    ContentKind::Assistant,
                    o,
                    meter.estimate(o, model).tokens,
                )
            })
            .collect();

        let mut summary = match self.collab.summarizer.summarize(&items).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "Scout compression summarizer failed, truncating raw output");
                outputs.join("\n")
            }
        };

        while meter.estimate(&summary, model).tokens > budget {
            let keep = (summary.chars().count() * 9) / 10;
            if keep == 0 {
                break;
            }
            summary = summary.chars().take(keep).collect();
        }
        summary
    }

    // --- Architecting ---

    async fn run_architecting(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        let plan = checkpoint.plan.clone().ok_or_else(|| PhaseError::Provider(
            crate::errors::ProviderError::InvalidRequest("architecting without a plan".into()),
        ))?;

        let mut state = PhaseState::pending(PhaseId::Architecting);
        state.start();
        state.items_in = rc.ctx.items().len();

        let research = checkpoint
            .scout_summary
            .clone()
            .unwrap_or_else(|| "(no research)".to_string());
        let description = checkpoint.task.description.clone();
        let request = CompletionRequest::new(
            &self.collab.model,
            vec![
                Message::system(architect_system_prompt()),
                Message::user(&format!(
                    "Request:\n{description}\n\nResearch:\n{research}"
                )),
            ],
            rc.envelope(checkpoint),
        )
        .with_metadata("phase", PhaseId::Architecting.as_str());

        let outcome = rc
            .runner
            .run(
                PhaseCall {
                    phase: PhaseId::Architecting,
                    cache_inputs: format!("architect\n{description}\n{research}"),
                    request,
                    cacheable: true,
                },
                &mut rc.ctx,
                &rc.ledger,
                &rc.bus,
                &rc.cancel,
            )
            .await?;

        let tasks: Vec<BuildTask> = match parse_json_payload(&outcome.text) {
            Some(tasks) => tasks,
            None => {
                state.finish(PhaseStatus::Failed { recoverable: false });
                checkpoint.record_phase(state);
                return Ok(Cursor::Failed {
                    reason: "architect response was not a parsable build task list".to_string(),
                });
            }
        };

        let mut plan = plan;
        if !tasks.is_empty() {
            plan.build_tasks = tasks;
        }
        if let Err(err) = plan.validate() {
            state.finish(PhaseStatus::Failed { recoverable: false });
            checkpoint.record_phase(state);
            return Ok(Cursor::Failed {
                reason: err.to_string(),
            });
        }

        rc.ctx.track(
            ContentKind::Decision,
            &format!("Architecture fixed: {} build tasks", plan.build_tasks.len()),
            Default::default(),
        );
        checkpoint.plan = Some(plan);

        state.items_out = rc.ctx.items().len();
        state.finish(PhaseStatus::Succeeded);
        checkpoint.record_phase(state);

        if !outcome.cache_hit {
            let _ = rc
                .bus
                .emit(
                    EventKind::PhaseChange,
                    Some(PhaseId::Architecting),
                    json!({"status": "succeeded"}),
                )
                .await;
        }
        Ok(Cursor::RunPhase {
            phase: PhaseId::Building,
        })
    }

    // --- Building ---

    async fn run_building(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        let plan = checkpoint.plan.clone().ok_or_else(|| PhaseError::Provider(
            crate::errors::ProviderError::InvalidRequest("building without a plan".into()),
        ))?;

        let mut state = checkpoint
            .phase_state(PhaseId::Building)
            .cloned()
            .unwrap_or_else(|| PhaseState::pending(PhaseId::Building));
        state.start();
        state.items_in = rc.ctx.items().len();

        let mut scheduler = crate::dag::WaveScheduler::from_tasks(&plan.build_tasks)
            .map_err(|err| PhaseError::Provider(
                crate::errors::ProviderError::InvalidRequest(err.to_string()),
            ))?;
        for id in &checkpoint.completed_build_tasks {
            scheduler.mark_succeeded(id);
        }

        let interventions = checkpoint
            .pending_fixes
            .iter()
            .map(|f| f.intervention.clone())
            .collect::<Vec<_>>()
            .join("\n");
        let snapshot_text = context_digest(&rc.ctx);
        let mut all_results = Vec::new();

        while !scheduler.all_terminal() {
            if rc.cancel.is_cancelled() {
                return Err(PhaseError::Cancelled);
            }

            let wave: Vec<BuildTask> = scheduler.ready_tasks().into_iter().cloned().collect();
            if wave.is_empty() {
                break;
            }
            for task in &wave {
                scheduler.mark_running(&task.id);
            }

            let mut jobs = Vec::with_capacity(wave.len());
            for task in &wave {
                jobs.push(self.builder_job(task, rc, &snapshot_text, &interventions, checkpoint));
            }

            let pool = WorkerPool::new(self.options.max_parallel_builders);
            let results = pool.run(jobs, &rc.cancel, None).await;

            for (task, result) in wave.iter().zip(&results) {
                match &result.status {
                    crate::pool::JobStatus::Ok => {
                        scheduler.mark_succeeded(&task.id);
                        if !checkpoint.completed_build_tasks.contains(&task.id) {
                            checkpoint.completed_build_tasks.push(task.id.clone());
                        }
                    }
                    crate::pool::JobStatus::Error { message } => {
                        scheduler.mark_failed(&task.id, message);
                    }
                    crate::pool::JobStatus::Cancelled => {
                        scheduler.mark_cancelled(&task.id);
                    }
                }
            }
            all_results.extend(results);

            // Progress is durable before the next wave's side effects begin.
            checkpoint.ledger = rc.ledger.lock().expect("ledger lock poisoned").clone();
            if let Err(err) = self.checkpoints.save(checkpoint) {
                warn!(error = %err, "Checkpoint write failed between waves");
            }
        }

        if rc.cancel.is_cancelled() {
            return Err(PhaseError::Cancelled);
        }

        let minimum = if plan.has_dependencies() {
            1.0
        } else {
            DEFAULT_MINIMUM_SUCCESS
        };
        let succeeded = scheduler.succeeded_count();
        if !scheduler.all_succeeded()
            && !(minimum < 1.0
                && meets_minimum_success(&all_results, minimum))
        {
            return Err(PhaseError::MinimumSuccessNotMet {
                succeeded,
                total: scheduler.task_count(),
            });
        }

        if let Some(vcs) = &self.collab.vcs {
            let files: Vec<PathBuf> = plan
                .build_tasks
                .iter()
                .flat_map(|t| t.outputs.iter().cloned())
                .collect();
            if let Err(err) = vcs.commit(&files, "Build wave complete") {
                let _ = rc
                    .bus
                    .emit(
                        EventKind::Log,
                        Some(PhaseId::Building),
                        json!({"level": "warn", "message": format!("vcs commit failed: {err}")}),
                    )
                    .await;
            }
        }

        checkpoint.pending_fixes.clear();
        self.emit_budget_state(rc, PhaseId::Building).await;

        state.items_out = rc.ctx.items().len();
        state.finish(PhaseStatus::Succeeded);
        checkpoint.record_phase(state);

        let _ = rc
            .bus
            .emit(
                EventKind::PhaseChange,
                Some(PhaseId::Building),
                json!({"status": "succeeded", "tasks": succeeded}),
            )
            .await;
        Ok(Cursor::RunPhase {
            phase: PhaseId::Validating,
        })
    }

    fn builder_job(
        &self,
        task: &BuildTask,
        rc: &RunCtx,
        snapshot_text: &str,
        interventions: &str,
        checkpoint: &Checkpoint,
    ) -> Job {
        let bus = Arc::clone(&rc.bus);
        let client = Arc::clone(&rc.client);
        let ledger = Arc::clone(&rc.ledger);
        let model = self.collab.model.clone();
        let target_dir = checkpoint.task.target_directory.clone();
        let task = task.clone();
        let envelope = rc.envelope(checkpoint).min(task.max_tokens.max(1));
        let prompt = builder_prompt(&task, snapshot_text, interventions);
        let job_id = format!("build:{}", task.id);

        Job::new(&job_id.clone(), move |cancel| {
            Box::pin(async move {
                let _ = bus
                    .emit(
                        EventKind::WorkerStarted,
                        Some(PhaseId::Building),
                        json!({"worker": job_id, "task": task.id}),
                    )
                    .await;
                let request = CompletionRequest::new(&model, vec![Message::user(&prompt)], envelope);
                let call = match client.complete(&request, &cancel).await {
                    Ok(call) => call,
                    Err(err) => {
                        let _ = bus
                            .emit(
                                EventKind::WorkerFailed,
                                Some(PhaseId::Building),
                                json!({"worker": job_id, "error": err.to_string()}),
                            )
                            .await;
                        return Err(err.to_string());
                    }
                };

                ledger.lock().expect("ledger lock poisoned").add(
                    PhaseId::Building,
                    call.input_tokens,
                    call.output_tokens,
                    call.cost_minor,
                );

                match write_outputs(&target_dir, &task, &call.text) {
                    Ok(written) => {
                        let _ = bus
                            .emit(
                                EventKind::WorkerCompleted,
                                Some(PhaseId::Building),
                                json!({
                                    "worker": job_id,
                                    "task": task.id,
                                    "files": written.len(),
                                    "tokens": call.total_tokens(),
                                }),
                            )
                            .await;
                        Ok(JobOutput {
                            tokens: call.total_tokens(),
                            text: call.text,
                        })
                    }
                    Err(message) => {
                        let _ = bus
                            .emit(
                                EventKind::WorkerFailed,
                                Some(PhaseId::Building),
                                json!({"worker": job_id, "error": message}),
                            )
                            .await;
                        Err(message)
                    }
                }
            })
        })
    }

    // --- Validating ---

    async fn run_validating(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        let plan = checkpoint.plan.clone().ok_or_else(|| PhaseError::Provider(
            crate::errors::ProviderError::InvalidRequest("validating without a plan".into()),
        ))?;

        let mut state = PhaseState::pending(PhaseId::Validating);
        state.start();
        state.items_in = rc.ctx.items().len();

        let validator = Validator::new(
            self.options.validator_thresholds.clone(),
            self.options.validator_attempts,
        );

        let mut reports: Vec<(String, ValidationReport)> = Vec::new();
        for task in &plan.build_tasks {
            if rc.cancel.is_cancelled() {
                return Err(PhaseError::Cancelled);
            }
            let artifact_text = read_outputs(&checkpoint.task.target_directory, task);
            let report = validator
                .validate(
                    &task.id,
                    &artifact_text,
                    &plan,
                    self.collab.scorer.as_ref(),
                    self.collab.test_runner.as_deref(),
                    &task.outputs,
                )
                .await
                .map_err(|err| PhaseError::Provider(
                    crate::errors::ProviderError::InvalidRequest(err.to_string()),
                ))?;
            reports.push((task.id.clone(), report));
        }

        let aggregate = aggregate_reports(&reports);
        let _ = rc
            .bus
            .emit(
                EventKind::ValidationResult,
                Some(PhaseId::Validating),
                json!({
                    "passed": aggregate.passed,
                    "overall": aggregate.overall,
                    "scores": aggregate.scores,
                    "failures": aggregate.failures.len(),
                }),
            )
            .await;

        state.items_out = rc.ctx.items().len();

        if aggregate.passed {
            state.finish(PhaseStatus::Succeeded);
            checkpoint.record_phase(state);
            let _ = rc
                .bus
                .emit(
                    EventKind::PhaseChange,
                    Some(PhaseId::Validating),
                    json!({"status": "succeeded"}),
                )
                .await;
            return Ok(Cursor::Completed);
        }

        if checkpoint.heal_attempts < self.options.max_heal_attempts {
            state.finish(PhaseStatus::Failed { recoverable: true });
            checkpoint.record_phase(state);
            checkpoint.pending_fixes = aggregate.failures;
            let _ = rc
                .bus
                .emit(
                    EventKind::PhaseChange,
                    Some(PhaseId::Validating),
                    json!({"status": "failed", "healing": true}),
                )
                .await;
            return Ok(Cursor::RunPhase {
                phase: PhaseId::Healing,
            });
        }

        state.finish(PhaseStatus::Failed { recoverable: false });
        checkpoint.record_phase(state);
        let failing: Vec<String> = aggregate
            .failures
            .iter()
            .map(|f| f.dimension.clone())
            .collect();
        Err(PhaseError::ValidationFailed { failing })
    }

    // --- Healing ---

    async fn run_healing(
        &self,
        checkpoint: &mut Checkpoint,
        rc: &mut RunCtx,
    ) -> Result<Cursor, PhaseError> {
        checkpoint.heal_attempts += 1;
        let attempt = checkpoint.heal_attempts;

        let mut state = PhaseState::pending(PhaseId::Healing);
        state.start();

        let fixes = checkpoint.pending_fixes.clone();
        let _ = rc
            .bus
            .emit(
                EventKind::HealAttempt,
                Some(PhaseId::Healing),
                json!({
                    "attempt": attempt,
                    "max_attempts": self.options.max_heal_attempts,
                    "fix_tasks": fixes.len(),
                }),
            )
            .await;

        // Failures become protected context so builder prompts carry them.
        for fix in &fixes {
            rc.ctx.track(
                ContentKind::Error,
                &format!("{} [{}]: {}", fix.artifact_key, fix.dimension, fix.intervention),
                Default::default(),
            );
        }

        // Re-run only build tasks named by the fix tasks; when none match,
        // the failure could not be localized and everything rebuilds.
        let affected: Vec<String> = if let Some(plan) = &checkpoint.plan {
            let named: Vec<String> = fixes
                .iter()
                .filter(|f| plan.build_task(&f.artifact_key).is_some())
                .map(|f| f.artifact_key.clone())
                .collect();
            if named.is_empty() {
                plan.build_tasks.iter().map(|t| t.id.clone()).collect()
            } else {
                named
            }
        } else {
            Vec::new()
        };
        checkpoint
            .completed_build_tasks
            .retain(|id| !affected.contains(id));

        state.finish(PhaseStatus::Succeeded);
        checkpoint.record_phase(state);
        Ok(Cursor::RunPhase {
            phase: PhaseId::Building,
        })
    }

    async fn emit_budget_state(&self, rc: &RunCtx, phase: PhaseId) {
        let used = {
            let ledger = rc.ledger.lock().expect("ledger lock poisoned");
            ledger.phase(phase).total_tokens()
        };
        let check = rc.runner.monitor().check(phase, used);
        for warning in &check.warnings {
            let _ = rc
                .bus
                .emit(
                    EventKind::ContextUpdate,
                    Some(phase),
                    json!({"zone": check.zone, "warning": warning}),
                )
                .await;
        }
    }
}

// --- Prompt assembly ---

fn planning_system_prompt() -> &'static str {
    "You are the planning stage of a build orchestrator. Produce a JSON plan \
     with `topics` (research topics: title, prompt, estimated_tokens) and \
     `build_tasks` (id, title, inputs, outputs, deps, max_tokens). Output \
     JSON only."
}

fn architect_system_prompt() -> &'static str {
    "You are the architecture stage of a build orchestrator. From the request \
     and research, produce the ordered JSON list of build tasks (id, title, \
     inputs, outputs, deps, max_tokens). Dependencies must form a DAG and \
     output paths must not overlap. Output JSON only."
}

fn builder_prompt(task: &BuildTask, snapshot: &str, interventions: &str) -> String {
    let outputs: Vec<String> = task
        .outputs
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let mut prompt = format!(
        "Implement build task '{}' ({}).\n\
         Produce a JSON object {{\"files\": {{<path>: <content>}}}} covering \
         exactly these paths: {}.\n",
        task.id,
        task.title,
        outputs.join(", ")
    );
    if !task.inputs.is_empty() {
        prompt.push_str(&format!("Input artifacts: {}\n", task.inputs.join(", ")));
    }
    if !interventions.is_empty() {
        prompt.push_str(&format!("\nFix the following first:\n{interventions}\n"));
    }
    if !snapshot.is_empty() {
        prompt.push_str(&format!("\nContext:\n{snapshot}\n"));
    }
    prompt
}

/// Compact text rendering of the kept context for worker subprompts.
fn context_digest(ctx: &ContextManager) -> String {
    ctx.snapshot()
        .iter()
        .map(|item| format!("- {}", item.text))
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Response decoding ---

/// Extract and decode the first JSON payload in a response, tolerating
/// prose around it.
fn parse_json_payload<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }
    for open in ['{', '['] {
        let close = if open == '{' { '}' } else { ']' };
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str(&text[start..=end])
        {
            return Some(value);
        }
    }
    None
}

#[derive(Debug, Deserialize)]
struct FilesPayload {
    files: BTreeMap<String, String>,
}

/// Write a builder response to the task's declared outputs.
///
/// The response is either a `{"files": {path: content}}` object or, for a
/// single-output task, raw file content. Undeclared paths are rejected, as
/// are absolute paths and any traversal outside the target directory.
fn write_outputs(target_dir: &Path, task: &BuildTask, response: &str) -> Result<Vec<PathBuf>, String> {
    let declared: Vec<&PathBuf> = task.outputs.iter().collect();

    let files: BTreeMap<String, String> = match parse_json_payload::<FilesPayload>(response) {
        Some(payload) => payload.files,
        None if declared.len() == 1 => {
            let mut map = BTreeMap::new();
            map.insert(declared[0].display().to_string(), response.to_string());
            map
        }
        None => {
            return Err(format!(
                "builder response for '{}' is not a files payload",
                task.id
            ));
        }
    };

    let mut written = Vec::new();
    for (path, content) in &files {
        let rel = PathBuf::from(path);
        if !declared.iter().any(|d| **d == rel) {
            return Err(format!(
                "builder for '{}' produced undeclared output {path}",
                task.id
            ));
        }
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(format!("output path {path} escapes the target directory"));
        }

        let full = target_dir.join(&rel);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("mkdir {}: {e}", parent.display()))?;
        }
        fs::write(&full, content).map_err(|e| format!("write {}: {e}", full.display()))?;
        written.push(rel);
    }
    Ok(written)
}

/// Concatenate a task's on-disk outputs for validation.
fn read_outputs(target_dir: &Path, task: &BuildTask) -> String {
    let mut text = String::new();
    for output in &task.outputs {
        let full = target_dir.join(output);
        text.push_str(&format!("=== {} ===\n", output.display()));
        match fs::read_to_string(&full) {
            Ok(content) => text.push_str(&content),
            Err(_) => text.push_str("(missing)"),
        }
        text.push('\n');
    }
    text
}

/// Merge per-artifact reports into one verdict. Scores aggregate with the
/// per-dimension minimum, so the task passes only if every artifact does.
fn aggregate_reports(reports: &[(String, ValidationReport)]) -> ValidationReport {
    if reports.is_empty() {
        return ValidationReport {
            scores: Scores::uniform(1.0),
            overall: 1.0,
            passed: true,
            failures: Vec::new(),
            variance: None,
            attempts: 1,
        };
    }

    let mut scores = Scores::uniform(1.0);
    let mut failures: Vec<FixTask> = Vec::new();
    let mut attempts = 1;
    for (_, report) in reports {
        scores.correctness = scores.correctness.min(report.scores.correctness);
        scores.coverage = scores.coverage.min(report.scores.coverage);
        scores.style = scores.style.min(report.scores.style);
        scores.integration = scores.integration.min(report.scores.integration);
        scores.safety = scores.safety.min(report.scores.safety);
        failures.extend(report.failures.iter().cloned());
        attempts = report.attempts;
    }

    ValidationReport {
        scores,
        overall: scores.overall(),
        passed: failures.is_empty(),
        failures,
        variance: None,
        attempts,
    }
}
