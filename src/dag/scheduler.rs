//! Wave scheduling over the build task graph.
//!
//! The scheduler computes execution waves - groups of tasks that can run in
//! parallel because their dependencies are satisfied - and tracks per-task
//! run status. Ready tasks within a wave are ordered lexicographically by id
//! so scheduling is deterministic.

use crate::dag::graph::{TaskGraph, TaskIndex};
use crate::task::BuildTask;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Run status of a build task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    /// Waiting to run.
    #[default]
    Pending,
    /// Currently running.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed with an error.
    Failed { error: String },
    /// Skipped because a dependency failed.
    Skipped,
    /// Cancelled by deadline or user request.
    Cancelled,
}

impl TaskRunStatus {
    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Skipped | Self::Cancelled
        )
    }

    /// Check if the task completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Tracks the run state of every task in a graph.
#[derive(Debug)]
pub struct WaveScheduler {
    graph: TaskGraph,
    statuses: Vec<TaskRunStatus>,
    completed: HashSet<TaskIndex>,
    failed: HashSet<TaskIndex>,
}

impl WaveScheduler {
    /// Create a scheduler from build tasks.
    pub fn from_tasks(tasks: &[BuildTask]) -> Result<Self> {
        let graph = TaskGraph::build(tasks)?;
        let statuses = vec![TaskRunStatus::Pending; graph.len()];
        Ok(Self {
            graph,
            statuses,
            completed: HashSet::new(),
            failed: HashSet::new(),
        })
    }

    /// Number of tasks in the schedule.
    pub fn task_count(&self) -> usize {
        self.graph.len()
    }

    /// The underlying graph.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Status of a task by id.
    pub fn status(&self, id: &str) -> Option<&TaskRunStatus> {
        self.graph.index_of(id).and_then(|i| self.statuses.get(i))
    }

    /// Compute execution waves without mutating state.
    ///
    /// Each wave is a list of task ids, lexicographically sorted, that can
    /// run in parallel once all previous waves complete.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut done: HashSet<TaskIndex> = HashSet::new();

        loop {
            let mut ready: Vec<String> = self
                .graph
                .tasks()
                .iter()
                .enumerate()
                .filter_map(|(i, task)| {
                    if done.contains(&i) {
                        return None;
                    }
                    if self.graph.dependencies_satisfied(i, &done) {
                        Some(task.id.clone())
                    } else {
                        None
                    }
                })
                .collect();

            if ready.is_empty() {
                break;
            }
            ready.sort();

            for id in &ready {
                if let Some(idx) = self.graph.index_of(id) {
                    done.insert(idx);
                }
            }
            waves.push(ready);
        }

        waves
    }

    /// Tasks that are ready to run now: pending with all dependencies
    /// succeeded. Sorted lexicographically by id.
    pub fn ready_tasks(&self) -> Vec<&BuildTask> {
        let mut ready: Vec<&BuildTask> = self
            .graph
            .tasks()
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                matches!(self.statuses[*i], TaskRunStatus::Pending)
                    && self.graph.dependencies_satisfied(*i, &self.completed)
            })
            .map(|(_, t)| t)
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// Mark a task as running.
    pub fn mark_running(&mut self, id: &str) {
        if let Some(idx) = self.graph.index_of(id) {
            self.statuses[idx] = TaskRunStatus::Running;
        }
    }

    /// Mark a task as succeeded, unblocking its dependents.
    pub fn mark_succeeded(&mut self, id: &str) {
        if let Some(idx) = self.graph.index_of(id) {
            self.statuses[idx] = TaskRunStatus::Succeeded;
            self.completed.insert(idx);
        }
    }

    /// Mark a task as failed and skip everything downstream of it.
    pub fn mark_failed(&mut self, id: &str, error: &str) {
        if let Some(idx) = self.graph.index_of(id) {
            self.statuses[idx] = TaskRunStatus::Failed {
                error: error.to_string(),
            };
            self.failed.insert(idx);
            self.skip_dependents(idx);
        }
    }

    /// Mark a task as cancelled.
    pub fn mark_cancelled(&mut self, id: &str) {
        if let Some(idx) = self.graph.index_of(id) {
            self.statuses[idx] = TaskRunStatus::Cancelled;
            self.failed.insert(idx);
            self.skip_dependents(idx);
        }
    }

    fn skip_dependents(&mut self, failed_idx: TaskIndex) {
        let dependents: Vec<TaskIndex> = self.graph.dependents(failed_idx).to_vec();
        for dep_idx in dependents {
            if !self.statuses[dep_idx].is_terminal() {
                self.statuses[dep_idx] = TaskRunStatus::Skipped;
                self.failed.insert(dep_idx);
                self.skip_dependents(dep_idx);
            }
        }
    }

    /// Check if every task reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }

    /// Check if every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.statuses.iter().all(|s| s.is_success())
    }

    /// Number of tasks that succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.completed.len()
    }

    /// Number of tasks that failed, were skipped, or were cancelled.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}
