//! Worker coordinator: registration, liveness and lease bookkeeping.
//!
//! The coordinator never touches an execution. When a worker goes silent it
//! hands back the tokens that worker held, and the scheduler force-expires
//! them in their executions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::domain::{
    Capability, DomainEvent, LeaseToken, SchedulerError, Worker, WorkerId, WorkerStatus,
};
use crate::ports::EventSink;

/// A worker that just missed its heartbeat deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    pub worker_id: WorkerId,
    pub last_heartbeat_at: DateTime<Utc>,

    /// Leases the worker held; each must be force-expired.
    pub leases: Vec<LeaseToken>,
}

pub struct WorkerCoordinator {
    workers: BTreeMap<WorkerId, Worker>,
    heartbeat_timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl WorkerCoordinator {
    pub fn new(heartbeat_timeout: Duration, events: Arc<dyn EventSink>) -> Self {
        Self {
            workers: BTreeMap::new(),
            heartbeat_timeout,
            events,
        }
    }

    /// Add a worker, or replace the capabilities of a known one.
    ///
    /// Re-registering revives an unreachable worker. Leases it still holds
    /// are kept.
    pub fn register(
        &mut self,
        worker_id: WorkerId,
        capabilities: BTreeSet<Capability>,
        now: DateTime<Utc>,
    ) {
        let worker = self
            .workers
            .entry(worker_id.clone())
            .or_insert_with(|| Worker::new(worker_id.clone(), BTreeSet::new(), now));
        worker.capabilities = capabilities.clone();
        worker.last_heartbeat_at = now;
        worker.status = WorkerStatus::Idle;
        worker.refresh_status();

        info!(worker_id = %worker_id, capabilities = capabilities.len(), "worker registered");
        self.events.emit(DomainEvent::WorkerRegistered {
            worker_id,
            capabilities,
            at: now,
        });
    }

    /// Drop a worker. Returns the leases it held, for force expiry.
    pub fn deregister(&mut self, worker_id: &WorkerId) -> Result<Vec<LeaseToken>, SchedulerError> {
        let worker = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.clone()))?;
        info!(worker_id = %worker_id, leases = worker.held_leases.len(), "worker deregistered");
        Ok(worker.held_leases.into_iter().collect())
    }

    /// Record a liveness signal. Revives an unreachable worker.
    pub fn heartbeat(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.clone()))?;
        worker.last_heartbeat_at = now;
        if worker.status == WorkerStatus::Unreachable {
            info!(worker_id = %worker_id, "worker reachable again");
            worker.status = WorkerStatus::Idle;
        }
        worker.refresh_status();
        Ok(())
    }

    /// Admit a claim: the worker must be known and reachable. Counts as a
    /// heartbeat. Returns the worker's capabilities.
    pub fn admit_claim(
        &mut self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<Capability>, SchedulerError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.clone()))?;
        if !worker.is_reachable() {
            return Err(SchedulerError::WorkerUnreachable(worker_id.clone()));
        }
        worker.last_heartbeat_at = now;
        Ok(worker.capabilities.clone())
    }

    /// Mark workers silent for longer than the heartbeat timeout as
    /// unreachable, stripping their leases.
    pub fn detect_unreachable(&mut self, now: DateTime<Utc>) -> Vec<Unreachable> {
        let mut lost = Vec::new();
        for worker in self.workers.values_mut() {
            if !worker.is_reachable() || now - worker.last_heartbeat_at <= self.heartbeat_timeout {
                continue;
            }
            worker.status = WorkerStatus::Unreachable;
            let leases: Vec<LeaseToken> = std::mem::take(&mut worker.held_leases)
                .into_iter()
                .collect();

            warn!(
                worker_id = %worker.id,
                last_heartbeat_at = %worker.last_heartbeat_at,
                leases = leases.len(),
                "worker unreachable"
            );
            self.events.emit(DomainEvent::WorkerUnreachable {
                worker_id: worker.id.clone(),
                last_heartbeat_at: worker.last_heartbeat_at,
            });
            lost.push(Unreachable {
                worker_id: worker.id.clone(),
                last_heartbeat_at: worker.last_heartbeat_at,
                leases,
            });
        }
        lost
    }

    /// Attach a freshly granted lease to its holder.
    ///
    /// Fails if the worker vanished or went unreachable since the claim was
    /// admitted; the caller must then expire the lease.
    pub fn lease_acquired(
        &mut self,
        worker_id: &WorkerId,
        token: LeaseToken,
    ) -> Result<(), SchedulerError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::UnknownWorker(worker_id.clone()))?;
        if !worker.is_reachable() {
            return Err(SchedulerError::WorkerUnreachable(worker_id.clone()));
        }
        worker.held_leases.insert(token);
        worker.refresh_status();
        Ok(())
    }

    pub fn lease_released(&mut self, worker_id: &WorkerId, token: &LeaseToken) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.held_leases.remove(token);
            worker.refresh_status();
        }
    }

    /// Capabilities offered by reachable workers, deduplicated and sorted.
    pub fn roster_capabilities(&self) -> Vec<Capability> {
        self.workers
            .values()
            .filter(|w| w.is_reachable())
            .flat_map(|w| w.capabilities.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Owned copy of every worker, ordered by id.
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.values().cloned().collect()
    }

    /// Replace the registry with snapshot records.
    pub(crate) fn restore(&mut self, workers: Vec<Worker>) {
        self.workers = workers.into_iter().map(|w| (w.id.clone(), w)).collect();
    }
}
