//! Orchestrator: executions and the scheduler control surface.

mod builder;
mod execution;
mod scheduler;

pub use builder::{BuildError, SchedulerBuilder};
pub use execution::{Execution, ExecutionSettings, ExecutionSnapshot};
pub use scheduler::{Scheduler, SchedulerSnapshot, SweepReport};
