//! Decomposer output: the candidate task list and its dependency edges.

use serde::{Deserialize, Serialize};

use super::Capability;

/// Default priority for tasks that do not specify one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Highest accepted priority; larger values are clamped.
pub const MAX_PRIORITY: u8 = 9;

/// One task proposed by a decomposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    pub required_capability: Capability,

    /// 0..=9, higher is claimed first.
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, required_capability: impl Into<Capability>) -> Self {
        Self {
            description: description.into(),
            required_capability: required_capability.into(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }
}

/// `to` depends on `from`. Both are indices into the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
}

impl Edge {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }
}

/// A candidate graph as returned by an objective decomposer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decomposition {
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Decomposition {
    pub fn new(tasks: Vec<TaskSpec>, edges: Vec<Edge>) -> Self {
        Self { tasks, edges }
    }
}
