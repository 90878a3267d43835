//! Dependency graph construction and validation for build tasks.
//!
//! The graph takes the plan's build tasks and validates the structure:
//! unique ids, known dependencies, no cycles. Wave computation and status
//! tracking live in [`super::scheduler`].

use crate::task::BuildTask;
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};

/// Index into the task list.
pub type TaskIndex = usize;

/// A directed acyclic graph of build tasks.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<BuildTask>,
    /// Map from task id to index
    index_map: HashMap<String, TaskIndex>,
    /// Forward edges: index -> tasks that depend on it
    forward_edges: Vec<Vec<TaskIndex>>,
    /// Reverse edges: index -> tasks it depends on
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build and validate a graph from the plan's build tasks.
    ///
    /// - All dependencies must reference existing tasks
    /// - Task ids must be unique
    /// - No cycles are allowed
    pub fn build(tasks: &[BuildTask]) -> Result<Self> {
        let tasks = tasks.to_vec();

        let mut index_map = HashMap::new();
        for (i, task) in tasks.iter().enumerate() {
            if index_map.contains_key(&task.id) {
                bail!("Duplicate build task id: {}", task.id);
            }
            index_map.insert(task.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];

        for (to_idx, task) in tasks.iter().enumerate() {
            for dep in &task.deps {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in build task '{}': no task with that id exists",
                        dep,
                        task.id
                    )
                })?;
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = Self {
            tasks,
            index_map,
            forward_edges,
            reverse_edges,
        };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get a task by its index.
    pub fn get(&self, index: TaskIndex) -> Option<&BuildTask> {
        self.tasks.get(index)
    }

    /// Get the index for a task id.
    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    /// Get all tasks.
    pub fn tasks(&self) -> &[BuildTask] {
        &self.tasks
    }

    /// Tasks that depend on the given task (forward edges).
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task depends on (reverse edges).
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Check if all dependencies of a task are in the completed set.
    pub fn dependencies_satisfied(&self, index: TaskIndex, completed: &HashSet<TaskIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in self.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.len() {
            let cycle_tasks: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| self.get(i).map(|t| t.id.as_str()))
                .collect();

            bail!(
                "Cycle detected in build task dependencies. Involved tasks: {:?}",
                cycle_tasks
            );
        }

        Ok(())
    }
}
