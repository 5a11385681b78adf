//! Error taxonomy.
//!
//! - `GraphError`: structural problems found while building or mutating a graph.
//! - `DecomposeError`: returned by an `ObjectiveDecomposer`.
//! - `SchedulerError`: everything the control surface can report to a caller.
//!
//! Lease errors tell a worker to drop its work and claim again; they are never
//! treated as task failures.

use thiserror::Error;

use super::{ExecutionId, TaskId, TaskState, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle among tasks {0:?}")]
    CycleDetected(Vec<TaskId>),

    #[error("task {task} depends on unknown task {missing}")]
    DanglingReference { task: String, missing: String },

    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    #[error("unknown task {0}")]
    UnknownTask(TaskId),

    #[error("invalid transition for {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("decomposer unavailable: {0}")]
    Unavailable(String),

    #[error("objective rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The decomposer failed or proposed a graph that cannot run.
    /// Fatal to that submission; not retried.
    #[error("decomposition invalid: {0}")]
    DecompositionInvalid(String),

    #[error("lease expired")]
    LeaseExpired,

    #[error("lease not found")]
    LeaseNotFound,

    #[error("unknown worker {0}; register first")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is unreachable; heartbeat to resume")]
    WorkerUnreachable(WorkerId),

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} was cancelled")]
    ExecutionCancelled(ExecutionId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl SchedulerError {
    /// Stale-lease errors: the caller should abandon its work and re-claim.
    pub fn is_stale_lease(&self) -> bool {
        matches!(
            self,
            SchedulerError::LeaseExpired
                | SchedulerError::LeaseNotFound
                | SchedulerError::ExecutionCancelled(_)
        )
    }
}
