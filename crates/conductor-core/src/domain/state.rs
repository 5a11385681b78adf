//! Task and execution state machines.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Ready (all dependencies completed, backoff elapsed)
/// - Ready -> Leased (claimed by a worker; this is the only place `attempt` grows)
/// - Leased -> Completed | Failed
/// - Leased -> Pending (lease expired or retryable failure; requeued)
/// - Pending -> Abandoned (a dependency failed)
/// - Ready | Leased -> Abandoned (execution cancelled)
///
/// Completed, Failed and Abandoned are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for dependencies or for a retry backoff to elapse.
    Pending,

    /// Every dependency is completed; eligible for claim.
    Ready,

    /// Held by exactly one worker under a lease.
    Leased,

    /// Finished successfully.
    Completed,

    /// Failed permanently (non-retryable or attempts exhausted).
    Failed,

    /// Can never run: a dependency failed or the execution was cancelled.
    Abandoned,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Abandoned
        )
    }

    /// Transition table. Everything not listed here is rejected by the graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Abandoned)
                | (Ready, Leased)
                | (Ready, Abandoned)
                | (Leased, Completed)
                | (Leased, Pending)
                | (Leased, Failed)
                | (Leased, Abandoned)
        )
    }
}

/// Execution lifecycle.
///
/// Submitted -> Decomposing -> Running -> {Succeeded | PartiallyFailed | Deadlocked | Cancelled}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Submitted,
    Decomposing,
    Running,

    /// Every task completed.
    Succeeded,

    /// Some task failed or was abandoned and nothing runnable remains.
    PartiallyFailed,

    /// Tasks remain pending with no way to become ready. Invariant violation.
    Deadlocked,

    /// Cancelled by the caller; all unfinished tasks were abandoned.
    Cancelled,
}

impl ExecutionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionPhase::Succeeded
                | ExecutionPhase::PartiallyFailed
                | ExecutionPhase::Deadlocked
                | ExecutionPhase::Cancelled
        )
    }
}
