//! Serializable views of an execution, handed out as owned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Capability, ExecutionId, ExecutionPhase, Lease, Task, TaskId, TaskState};

/// Number of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub ready: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl TaskCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Ready => self.ready += 1,
            TaskState::Leased => self.leased += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Abandoned => self.abandoned += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.ready + self.leased + self.completed + self.failed + self.abandoned
    }
}

/// Per-task row of an execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub description: String,
    pub required_capability: Capability,
    pub state: TaskState,
    pub attempt: u32,
    pub depends_on: Vec<TaskId>,
    pub result: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id(),
            description: task.description().to_string(),
            required_capability: task.required_capability().clone(),
            state: task.state(),
            attempt: task.attempt(),
            depends_on: task.depends_on().to_vec(),
            result: task.result().map(str::to_string),
            failure_reason: task.failure_reason().map(str::to_string),
        }
    }
}

/// Consistent snapshot of one execution, built under its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: ExecutionId,
    pub objective: String,
    pub phase: ExecutionPhase,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: TaskCounts,
    pub tasks: Vec<TaskView>,
    pub leases: Vec<Lease>,
}

impl ExecutionStatus {
    pub fn task(&self, task_id: TaskId) -> Option<&TaskView> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}
