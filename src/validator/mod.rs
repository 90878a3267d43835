//! Artifact validation against the fixed five-dimension rubric.
//!
//! Scoring is delegated to an injected [`RubricScorer`] (LLM-backed in
//! production, scripted in tests). When a [`TestRunner`] is configured the
//! correctness dimension comes from actual test results instead of the
//! scorer's opinion. Non-deterministic scorers can be sampled `k` times;
//! scores are averaged and the per-dimension variance recorded. Every
//! failing dimension yields a targeted fix task for the healing phase.

use crate::config::ValidatorThresholds;
use crate::task::Plan;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Characters kept in an intervention summary (~500 tokens).
const MAX_INTERVENTION_CHARS: usize = 2_000;

/// Scores in [0, 1] for each rubric dimension.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Scores {
    pub correctness: f64,
    pub coverage: f64,
    pub style: f64,
    pub integration: f64,
    pub safety: f64,
}

impl Scores {
    pub fn uniform(value: f64) -> Self {
        Self {
            correctness: value,
            coverage: value,
            style: value,
            integration: value,
            safety: value,
        }
    }

    fn dimensions(&self) -> [(&'static str, f64); 5] {
        [
            ("correctness", self.correctness),
            ("coverage", self.coverage),
            ("style", self.style),
            ("integration", self.integration),
            ("safety", self.safety),
        ]
    }

    /// Mean across the five dimensions.
    pub fn overall(&self) -> f64 {
        self.dimensions().iter().map(|(_, v)| v).sum::<f64>() / 5.0
    }

    fn threshold_for(thresholds: &ValidatorThresholds, dimension: &str) -> f64 {
        match dimension {
            "correctness" => thresholds.correctness,
            "coverage" => thresholds.coverage,
            "style" => thresholds.style,
            "integration" => thresholds.integration,
            "safety" => thresholds.safety,
            _ => 1.0,
        }
    }
}

/// Kind of remediation for a failing dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixKind {
    /// Patch the specific deficiency in place.
    TargetedPatch,
    /// The artifact is too far gone; produce it again.
    Regenerate,
    /// The failure looks like an ambiguous requirement, not bad code.
    ClarifyRequirement,
}

/// A remediation task derived from one failing rubric dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixTask {
    pub kind: FixKind,
    pub artifact_key: String,
    pub dimension: String,
    pub score: f64,
    pub threshold: f64,
    /// Suggested intervention, capped so healing prompts stay small.
    pub intervention: String,
}

/// The validation verdict for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub scores: Scores,
    pub overall: f64,
    pub passed: bool,
    pub failures: Vec<FixTask>,
    /// Per-dimension variance across attempts; absent for single attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance: Option<Scores>,
    pub attempts: u32,
}

/// Result of running a test suite for the correctness dimension.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TestRunReport {
    pub passed: u32,
    pub failed: u32,
    pub errors: Vec<String>,
}

impl TestRunReport {
    /// Pass fraction, or `None` when nothing ran.
    pub fn pass_fraction(&self) -> Option<f64> {
        let total = self.passed + self.failed;
        if total == 0 {
            return None;
        }
        Some(f64::from(self.passed) / f64::from(total))
    }
}

/// Per-language test runner used for the correctness dimension.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, paths: &[PathBuf]) -> anyhow::Result<TestRunReport>;
}

/// Scores an artifact on the rubric. LLM-backed in production.
#[async_trait]
pub trait RubricScorer: Send + Sync {
    async fn score(&self, artifact_text: &str, plan: &Plan) -> anyhow::Result<Scores>;
}

/// Rubric validator with thresholds and attempt averaging.
pub struct Validator {
    thresholds: ValidatorThresholds,
    attempts: u32,
}

impl Validator {
    pub fn new(thresholds: ValidatorThresholds, attempts: u32) -> Self {
        Self {
            thresholds,
            attempts: attempts.max(1),
        }
    }

    pub fn thresholds(&self) -> &ValidatorThresholds {
        &self.thresholds
    }

    /// Validate an artifact.
    ///
    /// Runs the scorer `attempts` times and averages. When a test runner is
    /// provided and its suite actually ran, the correctness dimension is the
    /// measured pass fraction rather than the scorer's estimate.
    pub async fn validate(
        &self,
        artifact_key: &str,
        artifact_text: &str,
        plan: &Plan,
        scorer: &dyn RubricScorer,
        test_runner: Option<&dyn TestRunner>,
        test_paths: &[PathBuf],
    ) -> anyhow::Result<ValidationReport> {
        let mut samples: Vec<Scores> = Vec::with_capacity(self.attempts as usize);
        for attempt in 0..self.attempts {
            let scores = scorer.score(artifact_text, plan).await?;
            debug!(attempt, ?scores, "Rubric sample");
            samples.push(scores);
        }

        let mut scores = average(&samples);
        let variance = (samples.len() > 1).then(|| variance_of(&samples, &scores));

        if let Some(runner) = test_runner {
            match runner.run(test_paths).await {
                Ok(report) => {
                    if let Some(fraction) = report.pass_fraction() {
                        scores.correctness = fraction;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "Test runner failed, keeping scorer correctness");
                }
            }
        }

        let mut failures = Vec::new();
        for (dimension, score) in scores.dimensions() {
            let threshold = Scores::threshold_for(&self.thresholds, dimension);
            if score < threshold {
                failures.push(derive_fix_task(artifact_key, dimension, score, threshold));
            }
        }

        Ok(ValidationReport {
            scores,
            overall: scores.overall(),
            passed: failures.is_empty(),
            failures,
            variance,
            attempts: self.attempts,
        })
    }
}

/// Remediation choice:
/// - a score under 0.4 means the artifact is too broken to patch
/// - integration and safety failures usually trace back to unclear requirements
/// - anything else gets a targeted patch
fn derive_fix_task(artifact_key: &str, dimension: &str, score: f64, threshold: f64) -> FixTask {
    let kind = if score < 0.4 {
        FixKind::Regenerate
    } else if matches!(dimension, "integration" | "safety") {
        FixKind::ClarifyRequirement
    } else {
        FixKind::TargetedPatch
    };

    let intervention = match kind {
        FixKind::TargetedPatch => format!(
            "Dimension '{dimension}' scored {score:.2} against a {threshold:.2} minimum. \
             Identify the specific deficiencies and patch only the affected outputs."
        ),
        FixKind::Regenerate => format!(
            "Dimension '{dimension}' scored {score:.2}, far below the {threshold:.2} minimum. \
             Regenerate the artifact from its task definition rather than patching."
        ),
        FixKind::ClarifyRequirement => format!(
            "Dimension '{dimension}' scored {score:.2} against a {threshold:.2} minimum. \
             Re-read the relevant requirements and restate them before fixing."
        ),
    };

    FixTask {
        kind,
        artifact_key: artifact_key.to_string(),
        dimension: dimension.to_string(),
        score,
        threshold,
        intervention: truncate_chars(&intervention, MAX_INTERVENTION_CHARS),
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn average(samples: &[Scores]) -> Scores {
    let n = samples.len().max(1) as f64;
    let mut sum = Scores::default();
    for s in samples {
        sum.correctness += s.correctness;
        sum.coverage += s.coverage;
        sum.style += s.style;
        sum.integration += s.integration;
        sum.safety += s.safety;
    }
    Scores {
        correctness: sum.correctness / n,
        coverage: sum.coverage / n,
        style: sum.style / n,
        integration: sum.integration / n,
        safety: sum.safety / n,
    }
}

fn variance_of(samples: &[Scores], mean: &Scores) -> Scores {
    let n = samples.len() as f64;
    let mut var = Scores::default();
    for s in samples {
        var.correctness += (s.correctness - mean.correctness).powi(2);
        var.coverage += (s.coverage - mean.coverage).powi(2);
        var.style += (s.style - mean.style).powi(2);
        var.integration += (s.integration - mean.integration).powi(2);
        var.safety += (s.safety - mean.safety).powi(2);
    }
    Scores {
        correctness: var.correctness / n,
        coverage: var.coverage / n,
        style: var.style / n,
        integration: var.integration / n,
        safety: var.safety / n,
    }
}
