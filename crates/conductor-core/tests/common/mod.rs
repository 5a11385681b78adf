#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use conductor_core::domain::{Capability, Decomposition, Edge, TaskId, TaskSpec, WorkerId};
use conductor_core::impls::{InMemoryEventSink, StaticDecomposer};
use conductor_core::ports::{Clock, ManualClock};
use conductor_core::queue::ClaimedTask;
use conductor_core::{Scheduler, SchedulerBuilder, SchedulerConfig};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `(description, capability)` per task; edges are `(from, to)`, `to`
/// depending on `from`.
pub fn decomposition(tasks: &[(&str, &str)], edges: &[(usize, usize)]) -> Decomposition {
    Decomposition::new(
        tasks
            .iter()
            .map(|&(description, capability)| TaskSpec::new(description, capability))
            .collect(),
        edges.iter().map(|&(f, t)| Edge::new(f, t)).collect(),
    )
}

pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<InMemoryEventSink>,
}

impl Harness {
    pub fn new(config: SchedulerConfig, decomposition: Decomposition) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let events = Arc::new(InMemoryEventSink::new());
        let scheduler = SchedulerBuilder::new()
            .config(config)
            .clock(clock.clone())
            .events(events.clone())
            .decomposer(StaticDecomposer::new(decomposition))
            .build()
            .unwrap();
        Self {
            scheduler: Arc::new(scheduler),
            clock,
            events,
        }
    }

    pub fn with_defaults(decomposition: Decomposition) -> Self {
        Self::new(SchedulerConfig::default(), decomposition)
    }

    pub async fn worker(&self, name: &str, capabilities: &[&str]) -> WorkerId {
        let id = WorkerId::new(name);
        self.scheduler
            .register_worker(id.clone(), capabilities.iter().map(|&c| Capability::from(c)))
            .await;
        id
    }

    pub async fn claim(&self, worker: &WorkerId) -> Option<ClaimedTask> {
        self.scheduler.claim_task(worker).await.unwrap()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Task ids of an execution, in insertion order.
pub async fn task_ids(
    scheduler: &Scheduler,
    execution_id: conductor_core::domain::ExecutionId,
) -> Vec<TaskId> {
    scheduler
        .get_execution_status(execution_id)
        .await
        .unwrap()
        .tasks
        .iter()
        .map(|t| t.task_id)
        .collect()
}
