//! Scheduler: the control surface over executions and the worker roster.
//!
//! Locking:
//! - executions map: `RwLock`, held only long enough to clone an `Arc`
//! - running index: `RwLock`, same; the subset claims and sweeps visit
//! - one `Mutex` per execution
//! - one `Mutex` for the worker coordinator
//!
//! No two of these are ever held at once, and no lock is held across a call
//! into the decomposer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use super::execution::{Execution, ExecutionSettings, ExecutionSnapshot};
use crate::config::SchedulerConfig;
use crate::coordinator::WorkerCoordinator;
use crate::domain::{
    Capability, ExecutionId, ExecutionPhase, ExecutionStatus, Lease, LeaseToken, SchedulerError,
    TaskSpec, Worker, WorkerId,
};
use crate::graph::{ExecutionPlan, TaskGraph};
use crate::ports::{Clock, EventSink, IdGenerator, ObjectiveDecomposer};
use crate::queue::ClaimedTask;

/// Serializable state of the whole scheduler, for restart recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub executions: Vec<ExecutionSnapshot>,
    pub workers: Vec<Worker>,
}

impl SchedulerSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// What one sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub unreachable_workers: usize,
    pub expired_leases: usize,
}

pub struct Scheduler {
    config: SchedulerConfig,
    settings: ExecutionSettings,

    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    events: Arc<dyn EventSink>,
    decomposer: Arc<dyn ObjectiveDecomposer>,

    executions: RwLock<BTreeMap<ExecutionId, Arc<Mutex<Execution>>>>,

    /// Executions not yet terminal.
    running: RwLock<BTreeMap<ExecutionId, Arc<Mutex<Execution>>>>,

    coordinator: Mutex<WorkerCoordinator>,

    /// Fired whenever tasks may have become claimable.
    ready_signal: Notify,
}

impl Scheduler {
    pub(crate) fn new(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        events: Arc<dyn EventSink>,
        decomposer: Arc<dyn ObjectiveDecomposer>,
    ) -> Self {
        let settings = ExecutionSettings {
            lease_ttl: to_chrono(config.lease_ttl()),
            retry: config.retry_policy(),
        };
        let coordinator =
            WorkerCoordinator::new(to_chrono(config.heartbeat_timeout()), events.clone());
        Self {
            config,
            settings,
            clock,
            ids,
            events,
            decomposer,
            executions: RwLock::new(BTreeMap::new()),
            running: RwLock::new(BTreeMap::new()),
            coordinator: Mutex::new(coordinator),
            ready_signal: Notify::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ---- executions ------------------------------------------------------

    /// Decompose `objective`, validate the candidate and start running it.
    ///
    /// Any decomposition problem is `DecompositionInvalid`; nothing is kept.
    pub async fn submit_execution(&self, objective: &str) -> Result<ExecutionId, SchedulerError> {
        let execution_id = self.ids.execution_id();
        info!(execution_id = %execution_id, phase = ?ExecutionPhase::Submitted, "execution submitted");

        let roster = self.coordinator.lock().await.roster_capabilities();
        debug!(
            execution_id = %execution_id,
            phase = ?ExecutionPhase::Decomposing,
            capabilities = roster.len(),
            "decomposing objective"
        );

        let decomposition = self
            .decomposer
            .decompose(objective, &roster)
            .await
            .map_err(|e| self.reject(execution_id, e.to_string()))?;
        self.validate(&decomposition.tasks, &roster)
            .map_err(|reason| self.reject(execution_id, reason))?;
        let graph = TaskGraph::construct(decomposition, self.ids.as_ref())
            .map_err(|e| self.reject(execution_id, e.to_string()))?;

        let now = self.clock.now();
        let task_count = graph.len();
        let execution = Execution::start(
            execution_id,
            objective,
            graph,
            &self.settings,
            self.events.clone(),
            now,
        )?;
        let execution = Arc::new(Mutex::new(execution));
        self.executions
            .write()
            .await
            .insert(execution_id, Arc::clone(&execution));
        self.running.write().await.insert(execution_id, execution);

        info!(
            execution_id = %execution_id,
            phase = ?ExecutionPhase::Running,
            tasks = task_count,
            "execution running"
        );
        self.ready_signal.notify_waiters();
        Ok(execution_id)
    }

    /// Abandon every unfinished task of an execution. Returns the phase
    /// afterwards; a finished execution keeps its phase.
    pub async fn cancel_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionPhase, SchedulerError> {
        let execution = self.execution(execution_id).await?;
        let now = self.clock.now();
        let (phase, released) = {
            let mut guard = execution.lock().await;
            guard.cancel(now)?;
            (guard.phase(), guard.drain_released())
        };
        self.release(released).await;
        self.retire_if_finished(execution_id, phase).await;
        info!(execution_id = %execution_id, phase = ?phase, "execution cancel requested");
        Ok(phase)
    }

    pub async fn get_execution_status(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionStatus, SchedulerError> {
        let execution = self.execution(execution_id).await?;
        let guard = execution.lock().await;
        Ok(guard.status())
    }

    /// Parallel waves and critical path of an execution's graph.
    pub async fn execution_plan(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionPlan, SchedulerError> {
        let execution = self.execution(execution_id).await?;
        let guard = execution.lock().await;
        Ok(guard.plan())
    }

    /// Known executions in submission order.
    pub async fn executions(&self) -> Vec<ExecutionId> {
        self.executions.read().await.keys().copied().collect()
    }

    /// Executions still running, in submission order.
    pub async fn running_executions(&self) -> Vec<ExecutionId> {
        self.running.read().await.keys().copied().collect()
    }

    // ---- workers ---------------------------------------------------------

    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        capabilities: impl IntoIterator<Item = Capability>,
    ) {
        let now = self.clock.now();
        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        self.coordinator
            .lock()
            .await
            .register(worker_id, capabilities, now);
        self.ready_signal.notify_waiters();
    }

    /// Remove a worker; its leases are reclaimed at once.
    pub async fn deregister_worker(&self, worker_id: &WorkerId) -> Result<(), SchedulerError> {
        let tokens = self.coordinator.lock().await.deregister(worker_id)?;
        self.reclaim(worker_id, tokens, self.clock.now()).await;
        Ok(())
    }

    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        self.coordinator.lock().await.heartbeat(worker_id, now)
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> Option<Worker> {
        self.coordinator.lock().await.worker(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<Worker> {
        self.coordinator.lock().await.workers()
    }

    // ---- leases ----------------------------------------------------------

    /// Lease one ready task the worker can perform, oldest execution first.
    ///
    /// `None` when nothing matches. A claim counts as a heartbeat.
    pub async fn claim_task(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<ClaimedTask>, SchedulerError> {
        let now = self.clock.now();
        let capabilities = self.coordinator.lock().await.admit_claim(worker_id, now)?;

        for (execution_id, execution) in self.live_executions().await {
            let (claimed, phase, released) = {
                let mut guard = execution.lock().await;
                let claimed = guard.claim(worker_id, &capabilities, self.ids.lease_nonce(), now)?;
                (claimed, guard.phase(), guard.drain_released())
            };
            self.release(released).await;
            self.retire_if_finished(execution_id, phase).await;

            let Some(claimed) = claimed else {
                continue;
            };
            let acquired = self
                .coordinator
                .lock()
                .await
                .lease_acquired(worker_id, claimed.token);
            if let Err(err) = acquired {
                // holder was lost between admission and grant
                self.force_expire(&claimed.token, now).await?;
                return Err(err);
            }
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    /// Like `claim_task`, but waits up to `timeout` for work to appear.
    pub async fn claim_task_wait(
        &self,
        worker_id: &WorkerId,
        timeout: Duration,
    ) -> Result<Option<ClaimedTask>, SchedulerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.claim_task(worker_id).await? {
                return Ok(Some(claimed));
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let wait = match self.next_wake().await {
                Some(at) => {
                    let until = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    remaining.min(until.max(Duration::from_millis(1)))
                }
                None => remaining,
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Extend a lease. Counts as a heartbeat for its holder.
    pub async fn renew_lease(&self, token: &LeaseToken) -> Result<DateTime<Utc>, SchedulerError> {
        let execution = self.execution_for(token).await?;
        let now = self.clock.now();
        let (renewed, phase, released) = {
            let mut guard = execution.lock().await;
            let renewed = guard.renew(token, now);
            (renewed, guard.phase(), guard.drain_released())
        };
        self.release(released).await;
        self.retire_if_finished(token.execution_id(), phase).await;
        let lease = renewed?;

        if let Err(err) = self
            .coordinator
            .lock()
            .await
            .heartbeat(&lease.worker_id, now)
        {
            debug!(worker_id = %lease.worker_id, error = %err, "renewal from unregistered holder");
        }
        Ok(lease.expires_at)
    }

    pub async fn report_completion(
        &self,
        token: &LeaseToken,
        result: impl Into<String>,
    ) -> Result<(), SchedulerError> {
        let execution = self.execution_for(token).await?;
        let now = self.clock.now();
        let (outcome, phase, released) = {
            let mut guard = execution.lock().await;
            let outcome = guard.complete(token, result.into(), now);
            (outcome, guard.phase(), guard.drain_released())
        };
        self.release(released).await;
        self.retire_if_finished(token.execution_id(), phase).await;
        self.ready_signal.notify_waiters();
        outcome
    }

    /// Report a failed attempt. `retryable` failures are retried with
    /// backoff while attempts remain.
    pub async fn report_failure(
        &self,
        token: &LeaseToken,
        reason: impl Into<String>,
        retryable: bool,
    ) -> Result<(), SchedulerError> {
        let execution = self.execution_for(token).await?;
        let now = self.clock.now();
        let (outcome, phase, released) = {
            let mut guard = execution.lock().await;
            let outcome = guard.fail(token, reason.into(), retryable, now);
            (outcome, guard.phase(), guard.drain_released())
        };
        self.release(released).await;
        self.retire_if_finished(token.execution_id(), phase).await;
        self.ready_signal.notify_waiters();
        outcome
    }

    // ---- maintenance -----------------------------------------------------

    /// Declare silent workers unreachable and reclaim their leases, then
    /// expire every lease past its deadline.
    ///
    /// A lease that cannot be reclaimed is logged and skipped; the rest of
    /// the sweep still runs.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let lost = self.coordinator.lock().await.detect_unreachable(now);
        report.unreachable_workers = lost.len();
        for worker in lost {
            report.expired_leases += self.reclaim(&worker.worker_id, worker.leases, now).await;
        }

        for (execution_id, execution) in self.live_executions().await {
            let (reaped, phase, released) = {
                let mut guard = execution.lock().await;
                let reaped = guard.reap(now);
                (reaped, guard.phase(), guard.drain_released())
            };
            self.release(released).await;
            self.retire_if_finished(execution_id, phase).await;
            match reaped {
                Ok(count) => report.expired_leases += count,
                Err(err) => {
                    error!(
                        execution_id = %execution_id,
                        error = %err,
                        "failed to reap expired leases"
                    );
                }
            }
        }

        if report.expired_leases > 0 {
            debug!(
                expired = report.expired_leases,
                unreachable = report.unreachable_workers,
                "sweep reclaimed leases"
            );
            self.ready_signal.notify_waiters();
        }
        report
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let executions: Vec<_> = self.executions.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(executions.len());
        for execution in executions {
            snapshots.push(execution.lock().await.snapshot());
        }
        SchedulerSnapshot {
            taken_at: self.clock.now(),
            executions: snapshots,
            workers: self.workers().await,
        }
    }

    /// Replace all state with a snapshot.
    ///
    /// Worker heartbeats restart at restore time so the fleet gets a full
    /// heartbeat timeout to reconnect.
    pub async fn restore(&self, snapshot: SchedulerSnapshot) -> Result<(), SchedulerError> {
        let now = self.clock.now();

        let mut restored = BTreeMap::new();
        for exec in snapshot.executions {
            let execution = Execution::restore(exec, &self.settings, self.events.clone(), now)?;
            restored.insert(execution.id(), Arc::new(Mutex::new(execution)));
        }

        let workers = snapshot
            .workers
            .into_iter()
            .map(|mut w| {
                w.last_heartbeat_at = now;
                w
            })
            .collect();
        let count = restored.len();
        let mut running = BTreeMap::new();
        for (&id, execution) in &restored {
            if !execution.lock().await.phase().is_terminal() {
                running.insert(id, Arc::clone(execution));
            }
        }
        self.coordinator.lock().await.restore(workers);
        *self.executions.write().await = restored;
        *self.running.write().await = running;

        info!(executions = count, taken_at = %snapshot.taken_at, "scheduler restored");
        self.ready_signal.notify_waiters();
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    fn validate(&self, tasks: &[TaskSpec], roster: &[Capability]) -> Result<(), String> {
        if tasks.is_empty() {
            return Err("decomposer returned no tasks".into());
        }
        let max = self.config.max_tasks_per_objective;
        if tasks.len() > max {
            return Err(format!("{} tasks exceed the limit of {max}", tasks.len()));
        }
        if let Some(spec) = tasks
            .iter()
            .find(|spec| !roster.contains(&spec.required_capability))
        {
            return Err(format!(
                "no reachable worker offers capability {}",
                spec.required_capability
            ));
        }
        Ok(())
    }

    fn reject(&self, execution_id: ExecutionId, reason: String) -> SchedulerError {
        warn!(execution_id = %execution_id, reason = %reason, "decomposition rejected");
        SchedulerError::DecompositionInvalid(reason)
    }

    async fn execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Arc<Mutex<Execution>>, SchedulerError> {
        self.executions
            .read()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or(SchedulerError::UnknownExecution(execution_id))
    }

    /// Route a token to its execution. Unknown executions mean an unknown
    /// lease.
    async fn execution_for(
        &self,
        token: &LeaseToken,
    ) -> Result<Arc<Mutex<Execution>>, SchedulerError> {
        self.execution(token.execution_id())
            .await
            .map_err(|_| SchedulerError::LeaseNotFound)
    }

    async fn live_executions(&self) -> Vec<(ExecutionId, Arc<Mutex<Execution>>)> {
        self.running
            .read()
            .await
            .iter()
            .map(|(&id, execution)| (id, Arc::clone(execution)))
            .collect()
    }

    async fn retire_if_finished(&self, execution_id: ExecutionId, phase: ExecutionPhase) {
        if phase.is_terminal() && self.running.write().await.remove(&execution_id).is_some() {
            debug!(execution_id = %execution_id, phase = ?phase, "execution retired");
        }
    }

    /// Force-expire the leases a lost worker held. Returns how many were
    /// reclaimed.
    async fn reclaim(
        &self,
        worker_id: &WorkerId,
        tokens: Vec<LeaseToken>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut reclaimed = 0;
        for token in tokens {
            match self.force_expire(&token, now).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(worker_id = %worker_id, error = %err, "failed to reclaim lease");
                }
            }
        }
        reclaimed
    }

    async fn next_wake(&self) -> Option<DateTime<Utc>> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for (_, execution) in self.live_executions().await {
            if let Some(at) = execution.lock().await.next_wake() {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }
        earliest
    }

    async fn force_expire(
        &self,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let Ok(execution) = self.execution_for(token).await else {
            return Ok(false);
        };
        let (expired, phase, released) = {
            let mut guard = execution.lock().await;
            let expired = guard.force_expire(token, now);
            (expired, guard.phase(), guard.drain_released())
        };
        self.release(released).await;
        self.retire_if_finished(token.execution_id(), phase).await;
        let expired = expired?;
        if expired {
            self.ready_signal.notify_waiters();
        }
        Ok(expired)
    }

    async fn release(&self, leases: Vec<Lease>) {
        if leases.is_empty() {
            return;
        }
        let mut coordinator = self.coordinator.lock().await;
        for lease in leases {
            coordinator.lease_released(&lease.worker_id, &lease.token);
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::days(365))
}
