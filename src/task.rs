//! Task and plan data model.
//!
//! A `Task` is the immutable root object created by the external driver.
//! Planning produces a `Plan`: scout topics to research and build tasks with
//! declared inputs, outputs, and dependencies. Plan validation enforces the
//! two structural invariants: the dependency graph is a DAG (checked in
//! [`crate::dag`]) and no two build tasks declare overlapping outputs.

use crate::config::Options;
use crate::errors::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Stable identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The immutable root object for one build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Free-text description of what to build.
    pub description: String,
    /// Directory the build writes artifacts into.
    pub target_directory: PathBuf,
    /// Named budget allocation table.
    pub budget_profile: String,
    pub options: Options,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with a generated id and the current time.
    pub fn new(description: &str, target_directory: PathBuf, options: Options) -> Self {
        Self {
            id: TaskId::generate(),
            description: description.to_string(),
            target_directory,
            budget_profile: options.budget_profile.clone(),
            options,
            created_at: Utc::now(),
        }
    }
}

/// A research topic for the scouting phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoutTopic {
    pub title: String,
    pub prompt: String,
    /// Estimated tokens this topic's research will consume.
    pub estimated_tokens: u64,
}

impl ScoutTopic {
    pub fn new(title: &str, prompt: &str) -> Self {
        Self {
            title: title.to_string(),
            prompt: prompt.to_string(),
            estimated_tokens: 0,
        }
    }
}

/// A unit of implementation work with declared inputs, outputs, and deps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    pub id: String,
    pub title: String,
    /// Artifact cache keys this task reads.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Relative file paths this task is permitted to produce.
    pub outputs: Vec<PathBuf>,
    /// Ids of build tasks that must succeed first.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Output token cap for this task's LLM call.
    pub max_tokens: u64,
}

impl BuildTask {
    pub fn new(id: &str, title: &str, outputs: Vec<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            inputs: Vec::new(),
            outputs,
            deps: Vec::new(),
            max_tokens: 8_192,
        }
    }

    /// Add dependency ids.
    pub fn with_deps(mut self, deps: Vec<&str>) -> Self {
        self.deps = deps.into_iter().map(String::from).collect();
        self
    }

    /// Add input artifact keys.
    pub fn with_inputs(mut self, inputs: Vec<&str>) -> Self {
        self.inputs = inputs.into_iter().map(String::from).collect();
        self
    }

    /// Set the output token cap.
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Output of the planning phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    pub topics: Vec<ScoutTopic>,
    pub build_tasks: Vec<BuildTask>,
}

impl Plan {
    pub fn new(topics: Vec<ScoutTopic>, build_tasks: Vec<BuildTask>) -> Self {
        Self {
            topics,
            build_tasks,
        }
    }

    /// Deduplicate topics by title, keeping first occurrence order.
    pub fn dedup_topics(&mut self) {
        let mut seen = HashSet::new();
        self.topics.retain(|t| seen.insert(t.title.clone()));
    }

    /// Validate the structural invariants: unique task ids, known deps,
    /// acyclic dependency graph, and disjoint output sets.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        crate::dag::TaskGraph::build(&self.build_tasks)
            .map_err(|e| OrchestratorError::InvalidPlan(e.to_string()))?;

        let mut claimed: HashMap<&PathBuf, &str> = HashMap::new();
        for task in &self.build_tasks {
            for output in &task.outputs {
                if let Some(other) = claimed.insert(output, &task.id) {
                    return Err(OrchestratorError::InvalidPlan(format!(
                        "Output {} is claimed by both '{}' and '{}'",
                        output.display(),
                        other,
                        task.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a build task by id.
    pub fn build_task(&self, id: &str) -> Option<&BuildTask> {
        self.build_tasks.iter().find(|t| t.id == id)
    }

    /// Build tasks whose outputs intersect the given paths. Used by healing
    /// to restrict re-building to affected outputs.
    pub fn tasks_touching(&self, paths: &[PathBuf]) -> Vec<&BuildTask> {
        let wanted: HashSet<&PathBuf> = paths.iter().collect();
        self.build_tasks
            .iter()
            .filter(|t| t.outputs.iter().any(|o| wanted.contains(o)))
            .collect()
    }

    /// True when any build task declares a dependency.
    pub fn has_dependencies(&self) -> bool {
        self.build_tasks.iter().any(|t| !t.deps.is_empty())
    }
}
