//! Task record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Capability, TaskId, TaskState};

/// A node of the task graph.
///
/// Design:
/// - Identity, description, capability, priority and dependencies are fixed at
///   construction.
/// - `state`, `attempt`, `result`, `failure_reason` and `not_before` change only
///   through `TaskGraph`, which enforces the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) description: String,
    pub(crate) required_capability: Capability,
    pub(crate) priority: u8,

    /// Dependencies in the order they were declared, without duplicates.
    pub(crate) depends_on: Vec<TaskId>,

    pub(crate) state: TaskState,

    /// Number of leases issued for this task.
    pub(crate) attempt: u32,

    pub(crate) result: Option<String>,
    pub(crate) failure_reason: Option<String>,

    /// Backoff gate: a requeued task stays Pending until this instant.
    #[serde(default)]
    pub(crate) not_before: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        description: impl Into<String>,
        required_capability: Capability,
        priority: u8,
        depends_on: Vec<TaskId>,
    ) -> Self {
        let mut deps: Vec<TaskId> = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        Self {
            id,
            description: description.into(),
            required_capability,
            priority,
            depends_on: deps,
            state: TaskState::Pending,
            attempt: 0,
            result: None,
            failure_reason: None,
            not_before: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn required_capability(&self) -> &Capability {
        &self.required_capability
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn depends_on(&self) -> &[TaskId] {
        &self.depends_on
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.not_before
    }

    /// Is the backoff gate (if any) open at `now`?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}
