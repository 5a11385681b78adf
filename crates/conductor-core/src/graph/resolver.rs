//! Dependency resolver: decides when a task becomes Ready.
//!
//! Each task carries a live count of dependencies that are not yet Completed.
//! A completion decrements the counters of its direct dependents only, so the
//! cost per event is the number of edges touched, not the size of the graph.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::TaskGraph;
use crate::domain::{GraphError, TaskId, TaskState};

#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    unmet: HashMap<TaskId, usize>,
}

impl DependencyResolver {
    /// Count unmet dependencies from the graph's current states.
    pub fn new(graph: &TaskGraph) -> Self {
        let unmet = graph
            .tasks()
            .map(|task| {
                let open = task
                    .depends_on()
                    .iter()
                    .filter(|&&dep| graph.state(dep) != Some(TaskState::Completed))
                    .count();
                (task.id(), open)
            })
            .collect();
        Self { unmet }
    }

    pub fn unmet(&self, task_id: TaskId) -> Option<usize> {
        self.unmet.get(&task_id).copied()
    }

    /// Initial ready set of a fresh graph: zero-dependency tasks, in insertion
    /// order.
    pub fn seed(
        &mut self,
        graph: &mut TaskGraph,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        self.recompute(graph, now)
    }

    /// Full pass over the graph, used when an execution is restored.
    ///
    /// Pending tasks behind a failed or abandoned dependency are abandoned;
    /// Pending tasks with no unmet dependency (and no backoff gate) become
    /// Ready. Returns the newly ready tasks in insertion order.
    pub fn recompute(
        &mut self,
        graph: &mut TaskGraph,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let failed_roots: Vec<TaskId> = graph
            .tasks()
            .filter(|t| matches!(t.state(), TaskState::Failed | TaskState::Abandoned))
            .map(|t| t.id())
            .collect();
        for root in failed_roots {
            self.on_failed(graph, root)?;
        }

        let mut ready = Vec::new();
        for task_id in graph.task_ids() {
            if self.promote_if_ready(graph, task_id, now)? {
                ready.push(task_id);
            }
        }
        Ok(ready)
    }

    /// `task_id` just completed: release its dependents.
    pub fn on_completed(
        &mut self,
        graph: &mut TaskGraph,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let mut ready = Vec::new();
        for dependent in graph.dependents(task_id) {
            if let Some(count) = self.unmet.get_mut(&dependent) {
                *count = count.saturating_sub(1);
            }
            if self.promote_if_ready(graph, dependent, now)? {
                ready.push(dependent);
            }
        }
        Ok(ready)
    }

    /// `task_id` failed for good: abandon everything downstream of it.
    ///
    /// Returns the tasks abandoned by this call.
    pub fn on_failed(
        &mut self,
        graph: &mut TaskGraph,
        task_id: TaskId,
    ) -> Result<Vec<TaskId>, GraphError> {
        let reason = format!("dependency {task_id} did not complete");
        let mut abandoned = Vec::new();
        let mut frontier: VecDeque<TaskId> = graph.dependents(task_id).into();

        while let Some(next) = frontier.pop_front() {
            if graph.state(next) != Some(TaskState::Pending) {
                continue;
            }
            graph.abandon(next, &reason)?;
            abandoned.push(next);
            frontier.extend(graph.dependents(next));
        }
        Ok(abandoned)
    }

    /// Pending, no unmet dependency, backoff elapsed: move to Ready.
    pub fn promote_if_ready(
        &self,
        graph: &mut TaskGraph,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<bool, GraphError> {
        let Some(task) = graph.get(task_id) else {
            return Err(GraphError::UnknownTask(task_id));
        };
        if task.state() != TaskState::Pending
            || self.unmet(task_id) != Some(0)
            || !task.is_due(now)
        {
            return Ok(false);
        }
        graph.apply_transition(task_id, TaskState::Ready)?;
        Ok(true)
    }
}
