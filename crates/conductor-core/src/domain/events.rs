//! Domain events, appended to the `EventSink` as state changes happen.
//!
//! The sink is write-only from the scheduler's point of view: nothing here is
//! read back while making a scheduling decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{Capability, ExecutionId, ExecutionPhase, LeaseToken, TaskId, TaskState, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ExecutionSubmitted {
        execution_id: ExecutionId,
        objective: String,
        task_count: usize,
        at: DateTime<Utc>,
    },
    TaskTransitioned {
        execution_id: ExecutionId,
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
        attempt: u32,
    },
    LeaseGranted {
        token: LeaseToken,
        task_id: TaskId,
        worker_id: WorkerId,
        expires_at: DateTime<Utc>,
    },
    LeaseReleased {
        token: LeaseToken,
        task_id: TaskId,
        worker_id: WorkerId,
    },
    WorkerRegistered {
        worker_id: WorkerId,
        capabilities: BTreeSet<Capability>,
        at: DateTime<Utc>,
    },
    WorkerUnreachable {
        worker_id: WorkerId,
        last_heartbeat_at: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        phase: ExecutionPhase,
        at: DateTime<Utc>,
    },
}
