//! Runtime options for a Foundry task.
//!
//! All recognized options live on [`Options`] with their documented defaults.
//! Validation happens once, up front; a bad value is a [`ConfigError`] and is
//! never retried.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default context window for a single LLM call, in tokens.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Default artifact TTL (24 hours).
pub const DEFAULT_ARTIFACT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Usage percentage at which standard compaction triggers.
pub const DEFAULT_COMPACTION_THRESHOLD_PCT: f64 = 40.0;

/// Usage percentage at which compaction is forced even if one already ran.
pub const FORCED_COMPACTION_PCT: f64 = 70.0;

/// Usage percentage at which the emergency stop fires.
pub const DEFAULT_EMERGENCY_STOP_PCT: f64 = 80.0;

/// Scope of the artifact cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheScope {
    /// Caching disabled; every phase does its own work.
    Off,
    /// Cache rooted in the task workspace.
    #[default]
    PerProject,
    /// Cache shared across projects.
    Global,
}

/// Per-rubric-dimension minimum scores for validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorThresholds {
    pub correctness: f64,
    pub coverage: f64,
    pub style: f64,
    pub integration: f64,
    pub safety: f64,
}

impl Default for ValidatorThresholds {
    fn default() -> Self {
        Self {
            correctness: 0.8,
            coverage: 0.7,
            style: 0.7,
            integration: 0.7,
            safety: 0.7,
        }
    }
}

impl ValidatorThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("correctness", self.correctness),
            ("coverage", self.coverage),
            ("style", self.style),
            ("integration", self.integration),
            ("safety", self.safety),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidOption {
                    option: format!("validator_thresholds.{name}"),
                    message: format!("{value} is outside [0, 1]"),
                });
            }
        }
        Ok(())
    }
}

/// The full recognized option set for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Options {
    /// Artifact cache scope.
    pub incremental: CacheScope,
    /// Maximum concurrent scout workers.
    pub max_parallel_scouts: usize,
    /// Maximum concurrent builder workers.
    pub max_parallel_builders: usize,
    /// Maximum self-healing rounds after a failed validation.
    pub max_heal_attempts: u32,
    /// Tokens available to a single LLM call.
    pub context_window: u64,
    /// Named budget allocation table.
    pub budget_profile: String,
    /// Usage percentage that triggers standard compaction.
    pub compaction_threshold_pct: f64,
    /// Usage percentage that triggers the emergency stop.
    pub emergency_stop_pct: f64,
    /// Time-to-live for cached artifacts.
    #[serde(with = "duration_secs")]
    pub artifact_ttl: Duration,
    /// Retry attempts for transient provider errors.
    pub provider_retries: u32,
    /// Per-dimension validation minimums.
    pub validator_thresholds: ValidatorThresholds,
    /// Validator attempts to average when the model is non-deterministic.
    pub validator_attempts: u32,
    /// Wall-clock deadline for the whole task.
    #[serde(default, with = "opt_duration_secs")]
    pub deadline: Option<Duration>,
    /// Root for the global cache when `incremental = global`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_cache_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            incremental: CacheScope::PerProject,
            max_parallel_scouts: 5,
            max_parallel_builders: 4,
            max_heal_attempts: 3,
            context_window: DEFAULT_CONTEXT_WINDOW,
            budget_profile: "default".to_string(),
            compaction_threshold_pct: DEFAULT_COMPACTION_THRESHOLD_PCT,
            emergency_stop_pct: DEFAULT_EMERGENCY_STOP_PCT,
            artifact_ttl: DEFAULT_ARTIFACT_TTL,
            provider_retries: 3,
            validator_thresholds: ValidatorThresholds::default(),
            validator_attempts: 1,
            deadline: None,
            global_cache_dir: None,
        }
    }
}

impl Options {
    /// Validate every option, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_scouts == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_parallel_scouts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_parallel_builders == 0 {
            return Err(ConfigError::InvalidOption {
                option: "max_parallel_builders".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.context_window == 0 {
            return Err(ConfigError::InvalidOption {
                option: "context_window".into(),
                message: "must be positive".into(),
            });
        }
        if !(0.0..=100.0).contains(&self.compaction_threshold_pct) {
            return Err(ConfigError::InvalidOption {
                option: "compaction_threshold_pct".into(),
                message: format!("{} is outside [0, 100]", self.compaction_threshold_pct),
            });
        }
        if !(0.0..=100.0).contains(&self.emergency_stop_pct) {
            return Err(ConfigError::InvalidOption {
                option: "emergency_stop_pct".into(),
                message: format!("{} is outside [0, 100]", self.emergency_stop_pct),
            });
        }
        if self.validator_attempts == 0 {
            return Err(ConfigError::InvalidOption {
                option: "validator_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        self.validator_thresholds.validate()?;
        if self.incremental == CacheScope::Global && self.global_cache_dir.is_none() {
            return Err(ConfigError::InvalidOption {
                option: "incremental".into(),
                message: "global cache scope requires global_cache_dir".into(),
            });
        }
        Ok(())
    }

    /// Set the cache scope.
    pub fn with_incremental(mut self, scope: CacheScope) -> Self {
        self.incremental = scope;
        self
    }

    /// Set the maximum concurrent scouts.
    pub fn with_max_parallel_scouts(mut self, n: usize) -> Self {
        self.max_parallel_scouts = n;
        self
    }

    /// Set the maximum concurrent builders.
    pub fn with_max_parallel_builders(mut self, n: usize) -> Self {
        self.max_parallel_builders = n;
        self
    }

    /// Set the heal attempt bound.
    pub fn with_max_heal_attempts(mut self, n: u32) -> Self {
        self.max_heal_attempts = n;
        self
    }

    /// Set the context window size.
    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }

    /// Set the budget profile name.
    pub fn with_budget_profile(mut self, profile: &str) -> Self {
        self.budget_profile = profile.to_string();
        self
    }

    /// Set the artifact TTL.
    pub fn with_artifact_ttl(mut self, ttl: Duration) -> Self {
        self.artifact_ttl = ttl;
        self
    }

    /// Set the overall task deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the validator thresholds.
    pub fn with_validator_thresholds(mut self, thresholds: ValidatorThresholds) -> Self {
        self.validator_thresholds = thresholds;
        self
    }

    /// Apply a `key=value` option string as parsed from the command line.
    pub fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidOption {
            option: key.to_string(),
            message,
        };
        match key {
            "incremental" => {
                self.incremental = match value {
                    "off" => CacheScope::Off,
                    "per-project" => CacheScope::PerProject,
                    "global" => CacheScope::Global,
                    other => return Err(invalid(format!("unknown scope '{other}'"))),
                };
            }
            "max_parallel_scouts" => {
                self.max_parallel_scouts = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "max_parallel_builders" => {
                self.max_parallel_builders = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "max_heal_attempts" => {
                self.max_heal_attempts = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "context_window" => {
                self.context_window = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "budget_profile" => self.budget_profile = value.to_string(),
            "compaction_threshold_pct" => {
                self.compaction_threshold_pct = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "emergency_stop_pct" => {
                self.emergency_stop_pct = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "artifact_ttl" => {
                let secs: u64 = value.parse().map_err(|e| invalid(format!("{e}")))?;
                self.artifact_ttl = Duration::from_secs(secs);
            }
            "provider_retries" => {
                self.provider_retries = value.parse().map_err(|e| invalid(format!("{e}")))?;
            }
            "deadline" => {
                let secs: u64 = value.parse().map_err(|e| invalid(format!("{e}")))?;
                self.deadline = Some(Duration::from_secs(secs));
            }
            other => return Err(invalid(format!("unrecognized option '{other}'"))),
        }
        Ok(())
    }
}

/// A named budget allocation table: percentage of the context window per phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetProfile {
    pub name: String,
    /// Phase name → percent of the window. Sums below 100 leave headroom.
    pub percentages: HashMap<String, f64>,
}

impl BudgetProfile {
    /// The standard allocation table.
    pub fn standard() -> Self {
        let mut percentages = HashMap::new();
        percentages.insert("system".to_string(), 15.0);
        percentages.insert("scouting".to_string(), 7.0);
        percentages.insert("architecting".to_string(), 7.0);
        percentages.insert("building".to_string(), 20.0);
        percentages.insert("validating".to_string(), 20.0);
        percentages.insert("documentation".to_string(), 5.0);
        percentages.insert("deploy".to_string(), 3.0);
        percentages.insert("feedback".to_string(), 5.0);
        Self {
            name: "default".to_string(),
            percentages,
        }
    }

    /// Look up a profile by name.
    pub fn named(name: &str) -> Result<Self, ConfigError> {
        match name {
            "default" => Ok(Self::standard()),
            other => Err(ConfigError::UnknownProfile(other.to_string())),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}
