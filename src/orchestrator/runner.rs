//! Single-phase driver: compaction, cache probe, provider call, budget check.
//!
//! Every LLM-backed phase goes through the same sequence:
//!
//! 1. Compact tracked context if the manager asks for it
//! 2. Enforce the emergency stop
//! 3. Probe the artifact cache; a hit skips the LLM work entirely
//! 4. Call the provider and record tokens and cost
//! 5. Re-check the budget; one forced compaction and retry on over-budget
//! 6. Store the artifact and report the outcome
//!
//! Budget warnings and cache degradations surface as events, never as
//! errors; only budget exhaustion after the forced compaction fails the
//! phase.

use crate::budget::{BudgetMonitor, BudgetZone};
use crate::cache::{Artifact, ArtifactCache, CacheKey, CacheWrite};
use crate::config::CacheScope;
use crate::context::{CompactionOutcome, ContextManager, Summarizer};
use crate::errors::{PhaseError, ProviderError};
use crate::events::{EventBus, EventKind};
use crate::phase::{PhaseId, TokenLedger};
use crate::provider::{CompletedCall, CompletionRequest, ProviderClient};
use serde_json::json;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Inputs for one phase execution.
pub struct PhaseCall {
    pub phase: PhaseId,
    /// Normalized inputs hashed into the cache key.
    pub cache_inputs: String,
    pub request: CompletionRequest,
    /// Whether this phase's artifact may be served from cache.
    pub cacheable: bool,
}

/// What a phase execution produced.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub text: String,
    pub cache_key: CacheKey,
    pub cache_hit: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Drives individual phases for the orchestrator.
pub struct PhaseRunner {
    client: Arc<ProviderClient>,
    cache: ArtifactCache,
    cache_scope: CacheScope,
    monitor: BudgetMonitor,
    summarizer: Arc<dyn Summarizer>,
    artifact_ttl: Duration,
}

impl PhaseRunner {
    pub fn new(
        client: Arc<ProviderClient>,
        cache: ArtifactCache,
        cache_scope: CacheScope,
        monitor: BudgetMonitor,
        summarizer: Arc<dyn Summarizer>,
        artifact_ttl: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            cache_scope,
            monitor,
            summarizer,
            artifact_ttl,
        }
    }

    pub fn monitor(&self) -> &BudgetMonitor {
        &self.monitor
    }

    /// Run one phase to completion.
    pub async fn run(
        &self,
        call: PhaseCall,
        ctx: &mut ContextManager,
        ledger: &Mutex<TokenLedger>,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome, PhaseError> {
        let phase = call.phase;
        let mut compacted_this_phase = false;

        if ctx.should_compact() {
            compacted_this_phase = self.compact(phase, ctx, ledger, bus).await;
        }

        if let (true, Some(reason)) = ctx.should_emergency_stop() {
            return Err(PhaseError::EmergencyStop { reason });
        }

        let model = &call.request.model;
        let cache_key = CacheKey::derive(phase, &call.cache_inputs, model);

        let use_cache = call.cacheable && self.cache_scope != CacheScope::Off;
        if use_cache
            && let Some(artifact) = self.cache.get(phase, &cache_key)
        {
            info!(%phase, key = cache_key.as_str(), "Cache hit, skipping LLM work");
            let _ = bus
                .emit(
                    EventKind::PhaseChange,
                    Some(phase),
                    json!({
                        "status": "succeeded",
                        "cache": "hit",
                        "skipped_due_to_cache": true,
                    }),
                )
                .await;
            return Ok(PhaseOutcome {
                text: artifact.text(),
                cache_key,
                cache_hit: true,
                input_tokens: 0,
                output_tokens: 0,
            });
        }

        let mut completed = self.call_provider(&call, phase, ledger, bus, cancel).await?;

        // The budget check polices the size of the call itself; compaction
        // shrinks the conversation, so one forced pass plus a retry can
        // bring an oversized call back under the allocation.
        let mut check = self
            .check_budget(phase, completed.total_tokens(), bus)
            .await;
        if check.zone == BudgetZone::OverBudget {
            if !compacted_this_phase
                && self.compact(phase, ctx, ledger, bus).await
            {
                completed = self.call_provider(&call, phase, ledger, bus, cancel).await?;
                check = self
                    .check_budget(phase, completed.total_tokens(), bus)
                    .await;
            }
            if check.zone == BudgetZone::OverBudget {
                return Err(PhaseError::BudgetExceeded {
                    phase: phase.to_string(),
                    used: check.used,
                    allocated: check.allocated,
                });
            }
        }

        if use_cache {
            let artifact = Artifact::new(
                phase,
                cache_key.clone(),
                completed.text.clone().into_bytes(),
                self.artifact_ttl,
                completed.total_tokens(),
                &completed.provider_id,
                model,
            );
            if let CacheWrite::Degraded { reason } = self.cache.put(&artifact) {
                let _ = bus
                    .emit(
                        EventKind::Log,
                        Some(phase),
                        json!({"level": "warn", "message": format!("cache write degraded: {reason}")}),
                    )
                    .await;
            }
        }

        Ok(PhaseOutcome {
            text: completed.text,
            cache_key,
            cache_hit: false,
            input_tokens: completed.input_tokens,
            output_tokens: completed.output_tokens,
        })
    }

    async fn call_provider(
        &self,
        call: &PhaseCall,
        phase: PhaseId,
        ledger: &Mutex<TokenLedger>,
        bus: &EventBus,
        cancel: &CancellationToken,
    ) -> Result<CompletedCall, PhaseError> {
        let completed = self
            .client
            .complete(&call.request, cancel)
            .await
            .map_err(|err| self.classify(err, cancel))?;

        {
            let mut ledger = ledger.lock().expect("ledger lock poisoned");
            ledger.add(
                phase,
                completed.input_tokens,
                completed.output_tokens,
                completed.cost_minor,
            );
        }

        if completed.pricing_fallback {
            let _ = bus
                .emit(
                    EventKind::ContextUpdate,
                    Some(phase),
                    json!({"pricing": "fallback", "model": call.request.model}),
                )
                .await;
        }

        debug!(
            %phase,
            input_tokens = completed.input_tokens,
            output_tokens = completed.output_tokens,
            attempts = completed.attempts,
            "Provider call complete"
        );
        Ok(completed)
    }

    fn classify(&self, err: ProviderError, cancel: &CancellationToken) -> PhaseError {
        if cancel.is_cancelled() {
            return PhaseError::Cancelled;
        }
        if err.is_transient() {
            PhaseError::ProviderExhausted {
                attempts: self.client.max_attempts(),
                source: err,
            }
        } else {
            PhaseError::Provider(err)
        }
    }

    async fn check_budget(
        &self,
        phase: PhaseId,
        used: u64,
        bus: &EventBus,
    ) -> crate::budget::BudgetCheck {
        let check = self.monitor.check(phase, used);
        for warning in &check.warnings {
            let _ = bus
                .emit(
                    EventKind::ContextUpdate,
                    Some(phase),
                    json!({
                        "zone": check.zone,
                        "warning": warning,
                        "used": check.used,
                        "allocated": check.allocated,
                    }),
                )
                .await;
        }
        check
    }

    /// Run a compaction pass, recording failures in the ledger and emitting
    /// the resulting context update. Returns whether tokens were reduced.
    async fn compact(
        &self,
        phase: PhaseId,
        ctx: &mut ContextManager,
        ledger: &Mutex<TokenLedger>,
        bus: &EventBus,
    ) -> bool {
        let outcome = ctx.compact(self.summarizer.as_ref()).await;
        match &outcome {
            CompactionOutcome::Accepted {
                tokens_before,
                tokens_after,
                ..
            } => {
                let _ = bus
                    .emit(
                        EventKind::ContextUpdate,
                        Some(phase),
                        json!({
                            "compaction": "accepted",
                            "tokens_before": tokens_before,
                            "tokens_after": tokens_after,
                        }),
                    )
                    .await;
                true
            }
            CompactionOutcome::Rejected { reason } => {
                ledger
                    .lock()
                    .expect("ledger lock poisoned")
                    .add_failed_compaction(phase);
                let _ = bus
                    .emit(
                        EventKind::ContextUpdate,
                        Some(phase),
                        json!({"compaction": "rejected", "reason": reason}),
                    )
                    .await;
                false
            }
            CompactionOutcome::Degraded { reason } => {
                ledger
                    .lock()
                    .expect("ledger lock poisoned")
                    .add_failed_compaction(phase);
                let _ = bus
                    .emit(
                        EventKind::ContextUpdate,
                        Some(phase),
                        json!({"compaction": "failed", "degraded": true, "reason": reason}),
                    )
                    .await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TokenMeter;
    use crate::config::BudgetProfile;
    use crate::context::{ContentItem, ContentKind};
    use crate::provider::pricing::{FlatPricing, PricingTable};
    use crate::provider::{CompletionResponse, LlmProvider, Message, RetryPolicy};
    use crate::task::TaskId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingProvider {
        calls: AtomicUsize,
        output_tokens: u64,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        fn id(&self) -> &str {
            "counting"
        }

        async fn complete(
            &self,
            _request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                text: "phase output".to_string(),
                input_tokens: Some(100),
                output_tokens: Some(self.output_tokens),
                latency_ms: 3,
                provider_id: "counting".to_string(),
            })
        }
    }

    struct NoopSummarizer;

    #[async_trait]
    impl crate::context::Summarizer for NoopSummarizer {
        async fn summarize(&self, _items: &[ContentItem]) -> anyhow::Result<String> {
            Ok("A sufficiently long summary of the earlier conversation covering decisions, \
                outputs, and the remaining work items for the active phase."
                .to_string())
        }
    }

    struct Fixture {
        _dir: TempDir,
        runner: PhaseRunner,
        provider_calls: Arc<CountingProvider>,
        bus: EventBus,
        ctx: ContextManager,
        ledger: Mutex<TokenLedger>,
    }

    fn fixture(output_tokens: u64, scope: CacheScope) -> Fixture {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            output_tokens,
        });
        let client = Arc::new(ProviderClient::new(
            provider.clone(),
            Arc::new(PricingTable::new()),
            Arc::new(FlatPricing::new(100.0, 100.0)),
            TokenMeter::new(),
            RetryPolicy::default(),
        ));
        let cache = ArtifactCache::open(dir.path().join("cache"));
        let monitor = BudgetMonitor::allocate(&BudgetProfile::standard(), 200_000);
        let runner = PhaseRunner::new(
            client,
            cache,
            scope,
            monitor,
            Arc::new(NoopSummarizer),
            Duration::from_secs(3600),
        );
        let bus = EventBus::open(&dir.path().join("events"), TaskId::from("t1")).unwrap();
        let ctx = ContextManager::with_defaults(TokenMeter::new(), "m", 200_000);
        Fixture {
            _dir: dir,
            runner,
            provider_calls: provider,
            bus,
            ctx,
            ledger: Mutex::new(TokenLedger::new()),
        }
    }

    fn call(phase: PhaseId, cacheable: bool) -> PhaseCall {
        PhaseCall {
            phase,
            cache_inputs: "inputs for the phase".to_string(),
            request: CompletionRequest::new("m", vec![Message::user("do the work")], 4096),
            cacheable,
        }
    }

    #[tokio::test]
    async fn runs_phase_and_records_ledger() {
        let mut f = fixture(50, CacheScope::PerProject);
        let outcome = f
            .runner
            .run(
                call(PhaseId::Scouting, true),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(outcome.text, "phase output");
        let slice = f.ledger.lock().unwrap().phase(PhaseId::Scouting);
        assert_eq!(slice.input_tokens, 100);
        assert_eq!(slice.output_tokens, 50);
        assert_eq!(slice.calls, 1);
    }

    #[tokio::test]
    async fn second_run_hits_cache_and_skips_provider() {
        let mut f = fixture(50, CacheScope::PerProject);
        let first = f
            .runner
            .run(
                call(PhaseId::Architecting, true),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!first.cache_hit);

        let second = f
            .runner
            .run(
                call(PhaseId::Architecting, true),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.text, "phase output");
        assert_eq!(f.provider_calls.calls.load(Ordering::SeqCst), 1);

        // The skip is visible on the event stream.
        let events = f.bus.replay(0).unwrap();
        assert!(events.iter().any(|e| {
            e.kind == EventKind::PhaseChange
                && e.payload["skipped_due_to_cache"] == serde_json::json!(true)
        }));
    }

    #[tokio::test]
    async fn cache_scope_off_always_calls_provider() {
        let mut f = fixture(50, CacheScope::Off);
        for _ in 0..2 {
            let outcome = f
                .runner
                .run(
                    call(PhaseId::Architecting, true),
                    &mut f.ctx,
                    &f.ledger,
                    &f.bus,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(!outcome.cache_hit);
        }
        assert_eq!(f.provider_calls.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn over_budget_phase_fails_after_forced_compaction() {
        // Scout allocation is 14k; a single 20k-output call exceeds it, and
        // with no compactable context the retry cannot help.
        let mut f = fixture(20_000, CacheScope::PerProject);
        let err = f
            .runner
            .run(
                call(PhaseId::Scouting, false),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PhaseError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn emergency_stop_fires_before_provider_work() {
        let mut f = fixture(50, CacheScope::PerProject);
        // Fill context past the 80% stop line.
        let filler = "x".repeat(4 * 170_000);
        f.ctx.track(ContentKind::Assistant, &filler, Default::default());

        let err = f
            .runner
            .run(
                call(PhaseId::Building, false),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PhaseError::EmergencyStop { .. }));
        assert_eq!(f.provider_calls.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_warnings_surface_as_events() {
        // 10k output against the 14k scout allocation lands in the dumb zone.
        let mut f = fixture(10_000, CacheScope::Off);
        f.runner
            .run(
                call(PhaseId::Scouting, false),
                &mut f.ctx,
                &f.ledger,
                &f.bus,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = f.bus.replay(0).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.kind == EventKind::ContextUpdate && e.payload.get("warning").is_some())
        );
    }
}
