//! Domain model (ids, states, specs, tasks, leases, workers, events, errors).

pub mod capability;
pub mod errors;
pub mod events;
pub mod execution;
pub mod ids;
pub mod lease;
pub mod spec;
pub mod state;
pub mod task;
pub mod worker;

pub use capability::Capability;
pub use errors::{DecomposeError, GraphError, SchedulerError};
pub use events::DomainEvent;
pub use execution::{ExecutionStatus, TaskCounts, TaskView};
pub use ids::{ExecutionId, TaskId};
pub use lease::{Lease, LeaseEnd, LeaseToken};
pub use spec::{DEFAULT_PRIORITY, Decomposition, Edge, MAX_PRIORITY, TaskSpec};
pub use state::{ExecutionPhase, TaskState};
pub use task::Task;
pub use worker::{Worker, WorkerId, WorkerStatus};
