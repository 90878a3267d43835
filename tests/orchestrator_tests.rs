//! End-to-end orchestrator scenarios.
//!
//! These tests drive full tasks through scripted collaborators: a provider
//! that dispatches on prompt shape, a deterministic summarizer, and a
//! scripted rubric scorer. Each scenario runs in its own temp workspace.

use async_trait::async_trait;
use foundry::budget::TokenMeter;
use foundry::checkpoint::{CheckpointStore, Cursor};
use foundry::config::Options;
use foundry::context::{ContentItem, ContentKind, ContextManager, Summarizer};
use foundry::errors::ProviderError;
use foundry::events::{EventBus, EventKind};
use foundry::orchestrator::{Collaborators, ExitStatus, Orchestrator, PhaseCall, PhaseRunner};
use foundry::phase::{PhaseId, TokenLedger};
use foundry::provider::{
    CompletionRequest, CompletionResponse, FlatPricing, LlmProvider, Message, PricingTable,
    ProviderClient, RetryPolicy,
};
use foundry::task::{Plan, TaskId};
use foundry::validator::{RubricScorer, Scores};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Provider that answers by prompt shape: planning, architecting, scouting,
/// and building prompts each get their scripted response.
struct ScriptedProvider {
    plan_json: String,
    architect_json: String,
    scout_text: String,
    /// Response per build task id; used for every builder prompt naming it.
    builder_responses: HashMap<String, String>,
    scout_calls: AtomicUsize,
    builder_calls: AtomicUsize,
    planning_max_tokens: AtomicU64,
}

impl ScriptedProvider {
    fn new(plan_json: &str, architect_json: &str) -> Self {
        Self {
            plan_json: plan_json.to_string(),
            architect_json: architect_json.to_string(),
            scout_text: "scout findings".to_string(),
            builder_responses: HashMap::new(),
            scout_calls: AtomicUsize::new(0),
            builder_calls: AtomicUsize::new(0),
            planning_max_tokens: AtomicU64::new(0),
        }
    }

    fn with_scout_text(mut self, text: &str) -> Self {
        self.scout_text = text.to_string();
        self
    }

    fn with_builder_response(mut self, task_id: &str, response: &str) -> Self {
        self.builder_responses
            .insert(task_id.to_string(), response.to_string());
        self
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let prompt: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let text = if prompt.contains("planning stage") {
            self.planning_max_tokens
                .store(request.max_output_tokens, Ordering::SeqCst);
            self.plan_json.clone()
        } else if prompt.contains("architecture stage") {
            self.architect_json.clone()
        } else if prompt.contains("Research the following topic") {
            self.scout_calls.fetch_add(1, Ordering::SeqCst);
            self.scout_text.clone()
        } else if prompt.contains("Implement build task") {
            self.builder_calls.fetch_add(1, Ordering::SeqCst);
            self.builder_responses
                .iter()
                .find(|(id, _)| prompt.contains(&format!("'{id}'")))
                .map(|(_, response)| response.clone())
                .unwrap_or_default()
        } else {
            // Summarization requests routed through the provider.
            "summary of prior work".to_string()
        };

        Ok(CompletionResponse {
            text,
            input_tokens: Some(50),
            output_tokens: Some(25),
            latency_ms: 1,
            provider_id: "scripted".to_string(),
        })
    }
}

struct GoodSummarizer;

#[async_trait]
impl Summarizer for GoodSummarizer {
    async fn summarize(&self, _items: &[ContentItem]) -> anyhow::Result<String> {
        Ok("Earlier work settled the module layout and storage decisions, resolved the \
            failing parser test, and left the remaining tasks queued for the build phase."
            .to_string())
    }
}

struct RefusingSummarizer;

#[async_trait]
impl Summarizer for RefusingSummarizer {
    async fn summarize(&self, _items: &[ContentItem]) -> anyhow::Result<String> {
        Ok("I don't see the content".to_string())
    }
}

/// Scorer that pops scripted scores, then settles on a default.
struct SequenceScorer {
    scripted: Mutex<Vec<Scores>>,
    default: Scores,
}

impl SequenceScorer {
    fn passing() -> Self {
        Self {
            scripted: Mutex::new(Vec::new()),
            default: Scores::uniform(0.95),
        }
    }

    fn failing_then_passing(first: Scores) -> Self {
        Self {
            scripted: Mutex::new(vec![first]),
            default: Scores::uniform(0.95),
        }
    }
}

#[async_trait]
impl RubricScorer for SequenceScorer {
    async fn score(&self, _artifact: &str, _plan: &Plan) -> anyhow::Result<Scores> {
        let mut scripted = self.scripted.lock().unwrap();
        Ok(if scripted.is_empty() {
            self.default
        } else {
            scripted.remove(0)
        })
    }
}

fn collaborators(
    provider: Arc<ScriptedProvider>,
    summarizer: Arc<dyn Summarizer>,
    scorer: Arc<dyn RubricScorer>,
) -> Collaborators {
    Collaborators {
        provider,
        pricing: Arc::new(PricingTable::new()),
        fallback_pricing: Arc::new(FlatPricing::new(100.0, 100.0)),
        summarizer,
        scorer,
        test_runner: None,
        vcs: None,
        meter: TokenMeter::new(),
        model: "scripted-model".to_string(),
    }
}

const HELLO_PLAN: &str = r#"{
    "topics": [],
    "build_tasks": [
        {"id": "t1", "title": "emit hello.txt", "outputs": ["hello.txt"], "max_tokens": 256}
    ]
}"#;

const HELLO_TASKS: &str =
    r#"[{"id": "t1", "title": "emit hello.txt", "outputs": ["hello.txt"], "max_tokens": 256}]"#;

fn events_for(workspace: &TempDir, task_id: &TaskId) -> Vec<foundry::events::Event> {
    let bus = EventBus::open(&workspace.path().join(".state/events"), task_id.clone()).unwrap();
    bus.replay(0).unwrap()
}

// =============================================================================
// S1: trivial build
// =============================================================================

#[tokio::test]
async fn trivial_build_produces_exact_artifact_and_event_stream() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(
        ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS).with_builder_response("t1", "hi\n"),
    );
    let options = Options::default()
        .with_max_parallel_builders(1)
        .with_max_heal_attempts(0);
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        options,
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    let outcome = orchestrator
        .start("emit a file hello.txt containing exactly hi")
        .await
        .unwrap();
    assert_eq!(outcome.status, ExitStatus::Completed);

    // The artifact is byte-exact.
    let bytes = std::fs::read(workspace.path().join("hello.txt")).unwrap();
    assert_eq!(bytes, vec![0x68, 0x69, 0x0A]);

    let events = events_for(&workspace, &outcome.task_id);

    // Exactly one phase_change per executed phase; scouting was skipped
    // silently because the plan had no topics.
    let mut phase_changes: HashMap<PhaseId, usize> = HashMap::new();
    for event in events.iter().filter(|e| e.kind == EventKind::PhaseChange) {
        *phase_changes.entry(event.phase_id.unwrap()).or_default() += 1;
    }
    let expected = [
        PhaseId::Planning,
        PhaseId::Architecting,
        PhaseId::Building,
        PhaseId::Validating,
    ];
    assert_eq!(phase_changes.len(), expected.len());
    for phase in expected {
        assert_eq!(phase_changes.get(&phase), Some(&1), "{phase} changes");
    }

    // Exactly one completion, and it is ok.
    let completions: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].payload["status"], "ok");

    // Sequence numbers are strictly monotone.
    for pair in events.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
    }
}

// =============================================================================
// S2: scout fan-out
// =============================================================================

#[tokio::test]
async fn scout_fan_out_compresses_architect_input() {
    let workspace = TempDir::new().unwrap();
    let plan = r#"{
        "topics": [
            {"title": "A", "prompt": "summarize A", "estimated_tokens": 100},
            {"title": "B", "prompt": "summarize B", "estimated_tokens": 100},
            {"title": "C", "prompt": "summarize C", "estimated_tokens": 100}
        ],
        "build_tasks": [
            {"id": "t1", "title": "emit hello.txt", "outputs": ["hello.txt"], "max_tokens": 256}
        ]
    }"#;
    let scout_text = "finding ".repeat(60); // 480 bytes of raw research each
    let provider = Arc::new(
        ScriptedProvider::new(plan, HELLO_TASKS)
            .with_scout_text(&scout_text)
            .with_builder_response("t1", "hi\n"),
    );
    let options = Options::default().with_max_parallel_scouts(3);
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        options,
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    let outcome = orchestrator.start("summarize three topics").await.unwrap();
    assert_eq!(outcome.status, ExitStatus::Completed);
    assert_eq!(provider.scout_calls.load(Ordering::SeqCst), 3);

    let events = events_for(&workspace, &outcome.task_id);
    let scout_events: Vec<_> = events
        .iter()
        .filter(|e| e.phase_id == Some(PhaseId::Scouting))
        .collect();
    let started = scout_events
        .iter()
        .filter(|e| e.kind == EventKind::WorkerStarted)
        .count();
    let completed = scout_events
        .iter()
        .filter(|e| e.kind == EventKind::WorkerCompleted)
        .count();
    assert_eq!(started, 3);
    assert_eq!(completed, 3);

    // Architect input is at most 25% of the raw scout output tokens.
    let store = CheckpointStore::open(workspace.path().join(".state/checkpoints")).unwrap();
    let checkpoint = store.load(&outcome.task_id).unwrap();
    let summary = checkpoint.scout_summary.unwrap();
    let meter = TokenMeter::new();
    let raw_tokens = 3 * u64::from(meter.estimate(&scout_text, "scripted-model").tokens);
    let summary_tokens = u64::from(meter.estimate(&summary, "scripted-model").tokens);
    assert!(
        summary_tokens * 4 <= raw_tokens,
        "summary {summary_tokens} tokens vs raw {raw_tokens}"
    );
}

// =============================================================================
// S3: budget breach with recovery
// =============================================================================

/// Provider whose reported input size drops once the conversation has been
/// compacted: the first call breaches the phase allocation, the retry fits.
struct ShrinkingProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for ShrinkingProvider {
    fn id(&self) -> &str {
        "shrinking"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let input_tokens = if call == 0 { 16_000 } else { 5_000 };
        Ok(CompletionResponse {
            text: "scout aggregate".to_string(),
            input_tokens: Some(input_tokens),
            output_tokens: Some(200),
            latency_ms: 1,
            provider_id: "shrinking".to_string(),
        })
    }
}

#[tokio::test]
async fn budget_breach_recovers_with_one_forced_compaction() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ShrinkingProvider {
        calls: AtomicUsize::new(0),
    });
    let client = Arc::new(ProviderClient::new(
        Arc::clone(&provider) as Arc<dyn LlmProvider>,
        Arc::new(PricingTable::new()),
        Arc::new(FlatPricing::new(100.0, 100.0)),
        TokenMeter::new(),
        RetryPolicy::default(),
    ));
    let monitor = foundry::budget::BudgetMonitor::allocate(
        &foundry::config::BudgetProfile::standard(),
        200_000,
    );
    let runner = PhaseRunner::new(
        client,
        foundry::cache::ArtifactCache::open(dir.path().join("cache")),
        foundry::config::CacheScope::Off,
        monitor,
        Arc::new(GoodSummarizer),
        Duration::from_secs(3600),
    );
    let bus = EventBus::open(&dir.path().join("events"), TaskId::from("s3")).unwrap();
    let ledger = Mutex::new(TokenLedger::new());

    // Seed the conversation with enough low-importance content that a
    // compaction pass has something to reduce.
    let mut ctx = ContextManager::with_defaults(TokenMeter::new(), "m", 200_000);
    let filler = "x".repeat(4_000);
    for _ in 0..20 {
        ctx.track(ContentKind::Assistant, &filler, Default::default());
    }
    let tokens_before = ctx.total_tokens();

    let outcome = runner
        .run(
            PhaseCall {
                phase: PhaseId::Scouting,
                cache_inputs: "s3".to_string(),
                request: CompletionRequest::new("m", vec![Message::user("aggregate")], 1_024),
                cacheable: false,
            },
            &mut ctx,
            &ledger,
            &bus,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!outcome.cache_hit);
    // Exactly one compaction ran and reduced tracked tokens by >= 10%.
    assert_eq!(ctx.completed_compactions(), 1);
    let tokens_after = ctx.total_tokens();
    assert!((tokens_before - tokens_after) as f64 >= tokens_before as f64 * 0.10);

    // The ledger shows both the pre- and post-compaction calls.
    let slice = ledger.lock().unwrap().phase(PhaseId::Scouting);
    assert_eq!(slice.calls, 2);
    assert_eq!(slice.input_tokens, 21_000);
}

// =============================================================================
// S4: emergency stop, then resume with a lower envelope
// =============================================================================

#[tokio::test]
async fn emergency_stop_fails_recoverably_and_resume_lowers_envelope() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(
        ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS).with_builder_response("t1", "hi\n"),
    );

    // A 100-token window: the description alone puts usage past the stop
    // line, and the refusing summarizer cannot reduce it.
    let cramped = Options::default().with_context_window(100);
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        cramped,
        collaborators(
            Arc::clone(&provider),
            Arc::new(RefusingSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    let description = "build the thing ".repeat(40);
    let outcome = orchestrator.start(&description).await.unwrap();
    match &outcome.status {
        ExitStatus::Failed { recoverable, .. } => assert!(recoverable),
        other => panic!("expected recoverable failure, got {other:?}"),
    }

    // The checkpoint still points at planning, with a halved envelope.
    let store = CheckpointStore::open(workspace.path().join(".state/checkpoints")).unwrap();
    let checkpoint = store.load(&outcome.task_id).unwrap();
    assert_eq!(
        checkpoint.cursor,
        Cursor::RunPhase {
            phase: PhaseId::Planning
        }
    );
    assert_eq!(checkpoint.output_envelope, Some(4_096));

    // Resume with a sane window succeeds and honors the lowered envelope.
    let roomy = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();
    let resumed = roomy.resume(&outcome.task_id).await.unwrap();
    assert_eq!(resumed.status, ExitStatus::Completed);
    assert_eq!(provider.planning_max_tokens.load(Ordering::SeqCst), 4_096);
}

// =============================================================================
// S5: resume after crash between building and validating
// =============================================================================

#[tokio::test]
async fn resume_after_crash_does_not_rerun_build_tasks() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(
        ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS).with_builder_response("t1", "hi\n"),
    );
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    let outcome = orchestrator.start("emit hello").await.unwrap();
    assert_eq!(outcome.status, ExitStatus::Completed);
    assert_eq!(provider.builder_calls.load(Ordering::SeqCst), 1);

    // Simulate a crash between Building and Validating: rewind the cursor
    // to the state the checkpoint had right after the building transition.
    let store = CheckpointStore::open(workspace.path().join(".state/checkpoints")).unwrap();
    let mut checkpoint = store.load(&outcome.task_id).unwrap();
    checkpoint.cursor = Cursor::RunPhase {
        phase: PhaseId::Validating,
    };
    store.save(&checkpoint).unwrap();

    let resumed = orchestrator.resume(&outcome.task_id).await.unwrap();
    assert_eq!(resumed.status, ExitStatus::Completed);

    // No build task was re-executed; validation ran once more.
    assert_eq!(provider.builder_calls.load(Ordering::SeqCst), 1);
    let events = events_for(&workspace, &outcome.task_id);
    let validations = events
        .iter()
        .filter(|e| e.kind == EventKind::ValidationResult)
        .count();
    assert_eq!(validations, 2);
    let last_completion = events
        .iter()
        .rev()
        .find(|e| e.kind == EventKind::Completion)
        .unwrap();
    assert_eq!(last_completion.payload["status"], "ok");
}

// =============================================================================
// S6: heal then succeed
// =============================================================================

#[tokio::test]
async fn failed_validation_heals_once_then_succeeds() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(
        ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS).with_builder_response("t1", "hi\n"),
    );
    let mut first = Scores::uniform(0.9);
    first.correctness = 0.5;
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::failing_then_passing(first)),
        ),
    )
    .unwrap();

    let outcome = orchestrator.start("emit hello, carefully").await.unwrap();
    assert_eq!(outcome.status, ExitStatus::Completed);

    // One heal attempt, and the affected task was rebuilt.
    let events = events_for(&workspace, &outcome.task_id);
    let heals = events
        .iter()
        .filter(|e| e.kind == EventKind::HealAttempt)
        .count();
    assert_eq!(heals, 1);
    assert_eq!(provider.builder_calls.load(Ordering::SeqCst), 2);

    // The final validation passed above threshold.
    let last_validation = events
        .iter()
        .rev()
        .find(|e| e.kind == EventKind::ValidationResult)
        .unwrap();
    assert_eq!(last_validation.payload["passed"], true);
    assert!(last_validation.payload["overall"].as_f64().unwrap() >= 0.8);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn pre_cancelled_task_exits_cleanly_and_can_resume() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(
        ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS).with_builder_response("t1", "hi\n"),
    );
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    orchestrator.cancel_token().cancel();
    let outcome = orchestrator.start("emit hello").await.unwrap();
    assert_eq!(outcome.status, ExitStatus::Cancelled);

    let events = events_for(&workspace, &outcome.task_id);
    let completion = events
        .iter()
        .find(|e| e.kind == EventKind::Completion)
        .unwrap();
    assert_eq!(completion.payload["status"], "cancelled");

    // A fresh orchestrator resumes the cancelled task to completion.
    let fresh = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            Arc::clone(&provider),
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();
    let resumed = fresh.resume(&outcome.task_id).await.unwrap();
    assert_eq!(resumed.status, ExitStatus::Completed);
    let artifact = std::fs::read_to_string(workspace.path().join("hello.txt")).unwrap();
    assert_eq!(artifact, "hi\n");
}

// =============================================================================
// Deadline
// =============================================================================

/// Provider that stalls long enough for a short task deadline to fire.
struct StallingProvider;

#[async_trait]
impl LlmProvider for StallingProvider {
    fn id(&self) -> &str {
        "stalling"
    }

    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(CompletionResponse {
            text: String::new(),
            input_tokens: Some(1),
            output_tokens: Some(1),
            latency_ms: 0,
            provider_id: "stalling".to_string(),
        })
    }
}

#[tokio::test]
async fn deadline_produces_deadline_exceeded_exit() {
    let workspace = TempDir::new().unwrap();
    let collab = Collaborators {
        provider: Arc::new(StallingProvider),
        pricing: Arc::new(PricingTable::new()),
        fallback_pricing: Arc::new(FlatPricing::new(100.0, 100.0)),
        summarizer: Arc::new(GoodSummarizer),
        scorer: Arc::new(SequenceScorer::passing()),
        test_runner: None,
        vcs: None,
        meter: TokenMeter::new(),
        model: "scripted-model".to_string(),
    };
    let options = Options::default().with_deadline(Duration::from_millis(100));
    let orchestrator =
        Orchestrator::new(workspace.path().to_path_buf(), options, collab).unwrap();

    let outcome = orchestrator.start("never finishes").await.unwrap();
    assert_eq!(outcome.status, ExitStatus::DeadlineExceeded);

    let events = events_for(&workspace, &outcome.task_id);
    let completion = events
        .iter()
        .find(|e| e.kind == EventKind::Completion)
        .unwrap();
    assert_eq!(completion.payload["status"], "deadline_exceeded");

    // Partial state is preserved for post-mortem or resume.
    let store = CheckpointStore::open(workspace.path().join(".state/checkpoints")).unwrap();
    assert!(store.load(&outcome.task_id).is_some());
}

// =============================================================================
// Option plumbing
// =============================================================================

#[tokio::test]
async fn invalid_options_fail_construction() {
    let workspace = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new(HELLO_PLAN, HELLO_TASKS));
    let result = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default().with_max_parallel_scouts(0),
        collaborators(
            provider,
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn overlapping_outputs_fail_planning() {
    let workspace = TempDir::new().unwrap();
    let bad_plan = r#"{
        "topics": [],
        "build_tasks": [
            {"id": "t1", "title": "a", "outputs": ["same.txt"], "max_tokens": 64},
            {"id": "t2", "title": "b", "outputs": ["same.txt"], "max_tokens": 64}
        ]
    }"#;
    let provider = Arc::new(ScriptedProvider::new(bad_plan, HELLO_TASKS));
    let orchestrator = Orchestrator::new(
        workspace.path().to_path_buf(),
        Options::default(),
        collaborators(
            provider,
            Arc::new(GoodSummarizer),
            Arc::new(SequenceScorer::passing()),
        ),
    )
    .unwrap();

    let outcome = orchestrator.start("two tasks, one file").await.unwrap();
    match outcome.status {
        ExitStatus::Failed { reason, .. } => assert!(reason.contains("same.txt")),
        other => panic!("expected failure, got {other:?}"),
    }
}
