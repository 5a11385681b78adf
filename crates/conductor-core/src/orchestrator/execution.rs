//! Execution: one objective's graph, resolver and queue behind one lock.
//!
//! Every mutation goes through here so that, after each step, the graph's
//! journal is published and terminal conditions are re-evaluated.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use ulid::Ulid;

use crate::domain::{
    Capability, DomainEvent, ExecutionId, ExecutionPhase, ExecutionStatus, GraphError, Lease,
    LeaseToken, SchedulerError, Task, TaskState, TaskView, WorkerId,
};
use crate::graph::{DependencyResolver, ExecutionPlan, TaskGraph};
use crate::ports::EventSink;
use crate::queue::{ClaimedTask, DistributionQueue, Release, RetryPolicy};

/// Per-execution knobs, taken from `SchedulerConfig`.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub lease_ttl: chrono::Duration,
    pub retry: RetryPolicy,
}

/// Serializable state of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub objective: String,
    pub phase: ExecutionPhase,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks: Vec<Task>,
    pub leases: Vec<Lease>,
}

pub struct Execution {
    id: ExecutionId,
    objective: String,
    phase: ExecutionPhase,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,

    graph: TaskGraph,
    resolver: DependencyResolver,
    queue: DistributionQueue,

    /// Leases ended since the last `drain_released`, for the coordinator.
    released: Vec<Lease>,

    events: Arc<dyn EventSink>,
}

impl Execution {
    /// Start a validated graph: seed the ready set and enter `Running`.
    pub fn start(
        id: ExecutionId,
        objective: impl Into<String>,
        mut graph: TaskGraph,
        settings: &ExecutionSettings,
        events: Arc<dyn EventSink>,
        now: DateTime<Utc>,
    ) -> Result<Self, GraphError> {
        let objective = objective.into();
        let mut resolver = DependencyResolver::new(&graph);
        let mut queue = DistributionQueue::new(id, settings.lease_ttl, settings.retry.clone());

        let ready = resolver.seed(&mut graph, now)?;
        queue.enqueue_all(&graph, ready)?;

        events.emit(DomainEvent::ExecutionSubmitted {
            execution_id: id,
            objective: objective.clone(),
            task_count: graph.len(),
            at: now,
        });

        let mut execution = Self {
            id,
            objective,
            phase: ExecutionPhase::Running,
            created_at: now,
            finished_at: None,
            graph,
            resolver,
            queue,
            released: Vec::new(),
            events,
        };
        execution.publish(now);
        Ok(execution)
    }

    /// Rebuild an execution from a snapshot.
    ///
    /// Unmet-dependency counters are recomputed from the restored states. A
    /// Leased task whose lease is missing goes back to Ready.
    pub fn restore(
        snapshot: ExecutionSnapshot,
        settings: &ExecutionSettings,
        events: Arc<dyn EventSink>,
        now: DateTime<Utc>,
    ) -> Result<Self, GraphError> {
        let ExecutionSnapshot {
            execution_id: id,
            objective,
            phase,
            created_at,
            finished_at,
            tasks,
            leases,
        } = snapshot;

        let mut graph = TaskGraph::from_tasks(tasks)?;
        let mut resolver = DependencyResolver::new(&graph);
        let mut queue = DistributionQueue::new(id, settings.lease_ttl, settings.retry.clone());

        for lease in leases {
            if graph.state(lease.task_id) == Some(TaskState::Leased) {
                queue.restore_lease(lease);
            }
        }

        let orphaned: Vec<_> = graph
            .tasks()
            .filter(|t| t.state() == TaskState::Leased)
            .map(Task::id)
            .filter(|&task_id| queue.lease_for(task_id).is_none())
            .collect();
        for task_id in orphaned {
            graph.requeue(task_id, None, "lease lost across restart".into())?;
        }

        let gated: Vec<_> = graph
            .tasks()
            .filter(|t| t.state() == TaskState::Pending)
            .filter_map(|t| t.not_before().map(|at| (t.id(), at)))
            .collect();
        for (task_id, at) in gated {
            queue.schedule(task_id, at);
        }

        if !phase.is_terminal() {
            resolver.recompute(&mut graph, now)?;
        }
        let ready: Vec<_> = graph
            .tasks()
            .filter(|t| t.state() == TaskState::Ready)
            .map(Task::id)
            .collect();
        queue.enqueue_all(&graph, ready)?;

        let mut execution = Self {
            id,
            objective,
            phase,
            created_at,
            finished_at,
            graph,
            resolver,
            queue,
            released: Vec::new(),
            events,
        };
        execution.publish(now);
        Ok(execution)
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn has_ready(&self) -> bool {
        self.queue.ready_len() > 0
    }

    /// Earliest backoff deadline, if a task is waiting on one.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.queue.next_wake()
    }

    /// Lease the best ready task `capabilities` can perform.
    ///
    /// Terminal executions never hand out work.
    pub fn claim(
        &mut self,
        worker_id: &WorkerId,
        capabilities: &BTreeSet<Capability>,
        nonce: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, SchedulerError> {
        if self.phase.is_terminal() {
            return Ok(None);
        }
        self.reap(now)?;
        if self.phase.is_terminal() {
            return Ok(None);
        }

        let claimed = self.queue.claim(
            &mut self.graph,
            &self.resolver,
            worker_id,
            capabilities,
            nonce,
            now,
        )?;
        if let Some(claimed) = &claimed {
            self.events.emit(DomainEvent::LeaseGranted {
                token: claimed.token,
                task_id: claimed.task_id,
                worker_id: worker_id.clone(),
                expires_at: claimed.expires_at,
            });
        }
        self.publish(now);
        Ok(claimed)
    }

    /// Returns the renewed lease.
    pub fn renew(&mut self, token: &LeaseToken, now: DateTime<Utc>) -> Result<Lease, SchedulerError> {
        self.reap(now)?;
        self.queue.renew(token, now)?;
        self.queue.lease(token).cloned()
    }

    pub fn complete(
        &mut self,
        token: &LeaseToken,
        result: String,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.reap(now)?;
        let release =
            self.queue
                .complete(&mut self.graph, &mut self.resolver, token, result, now)?;
        self.settle(release);
        self.publish(now);
        Ok(())
    }

    pub fn fail(
        &mut self,
        token: &LeaseToken,
        reason: String,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.reap(now)?;
        let release = self.queue.fail(
            &mut self.graph,
            &mut self.resolver,
            token,
            reason,
            retryable,
            now,
        )?;
        self.settle(release);
        self.publish(now);
        Ok(())
    }

    /// Expire every lease past its deadline. Returns how many were reclaimed.
    pub fn reap(&mut self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let released = self
            .queue
            .sweep_expired(&mut self.graph, &mut self.resolver, now)?;
        let count = released.len();
        for release in released {
            self.settle(release);
        }
        if count > 0 {
            self.publish(now);
        }
        Ok(count)
    }

    /// Reclaim one lease whatever its deadline (holder lost). Returns
    /// `false` if the token was no longer live.
    pub fn force_expire(
        &mut self,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let Some(release) =
            self.queue
                .force_expire(&mut self.graph, &mut self.resolver, token, now)?
        else {
            return Ok(false);
        };
        self.settle(release);
        self.publish(now);
        Ok(true)
    }

    /// Abandon every unfinished task and drop all leases.
    ///
    /// No-op on a terminal execution.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.phase.is_terminal() {
            return Ok(());
        }

        for lease in self.queue.cancel() {
            self.events.emit(DomainEvent::LeaseReleased {
                token: lease.token,
                task_id: lease.task_id,
                worker_id: lease.worker_id.clone(),
            });
            self.released.push(lease);
        }

        let open: Vec<_> = self
            .graph
            .tasks()
            .filter(|t| !t.state().is_terminal())
            .map(Task::id)
            .collect();
        for task_id in open {
            self.graph.abandon(task_id, "execution cancelled")?;
        }

        self.emit_transitions();
        self.finish(ExecutionPhase::Cancelled, now);
        Ok(())
    }

    /// Leases that ended since the last call.
    pub fn drain_released(&mut self) -> Vec<Lease> {
        std::mem::take(&mut self.released)
    }

    pub fn status(&self) -> ExecutionStatus {
        ExecutionStatus {
            execution_id: self.id,
            objective: self.objective.clone(),
            phase: self.phase,
            created_at: self.created_at,
            finished_at: self.finished_at,
            counts: self.graph.counts(),
            tasks: self.graph.tasks().map(TaskView::from).collect(),
            leases: self.queue.leases(),
        }
    }

    pub fn plan(&self) -> ExecutionPlan {
        ExecutionPlan::of(&self.graph)
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.id,
            objective: self.objective.clone(),
            phase: self.phase,
            created_at: self.created_at,
            finished_at: self.finished_at,
            tasks: self.graph.snapshot(),
            leases: self.queue.leases(),
        }
    }

    fn settle(&mut self, release: Release) {
        let lease = release.lease;
        self.events.emit(DomainEvent::LeaseReleased {
            token: lease.token,
            task_id: lease.task_id,
            worker_id: lease.worker_id.clone(),
        });
        self.released.push(lease);
    }

    fn emit_transitions(&mut self) {
        for t in self.graph.drain_transitions() {
            self.events.emit(DomainEvent::TaskTransitioned {
                execution_id: self.id,
                task_id: t.task_id,
                from: t.from,
                to: t.to,
                attempt: t.attempt,
            });
        }
    }

    /// Publish journaled transitions, then re-evaluate terminal conditions.
    fn publish(&mut self, now: DateTime<Utc>) {
        self.emit_transitions();
        if self.phase == ExecutionPhase::Running
            && let Some(phase) = self.evaluate()
        {
            self.finish(phase, now);
        }
    }

    fn evaluate(&self) -> Option<ExecutionPhase> {
        let counts = self.graph.counts();
        if counts.completed == counts.total() {
            return Some(ExecutionPhase::Succeeded);
        }

        let backing_off = self
            .graph
            .tasks()
            .any(|t| t.state() == TaskState::Pending && t.not_before().is_some());
        if counts.ready > 0 || counts.leased > 0 || backing_off {
            return None;
        }

        if counts.pending > 0 {
            let stuck: Vec<String> = self
                .graph
                .tasks()
                .filter(|t| t.state() == TaskState::Pending)
                .map(|t| t.id().to_string())
                .collect();
            error!(
                execution_id = %self.id,
                stuck = ?stuck,
                "execution deadlocked: pending tasks with nothing ready or leased"
            );
            return Some(ExecutionPhase::Deadlocked);
        }
        Some(ExecutionPhase::PartiallyFailed)
    }

    fn finish(&mut self, phase: ExecutionPhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.finished_at = Some(now);

        let counts = self.graph.counts();
        info!(
            execution_id = %self.id,
            phase = ?phase,
            completed = counts.completed,
            failed = counts.failed,
            abandoned = counts.abandoned,
            "execution finished"
        );
        self.events.emit(DomainEvent::ExecutionFinished {
            execution_id: self.id,
            phase,
            at: now,
        });
    }
}
