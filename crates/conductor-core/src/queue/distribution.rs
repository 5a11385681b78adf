//! Distribution queue of one execution: ready set, lease table and backoff
//! schedule.
//!
//! The queue does not own the graph. Every operation borrows the execution's
//! `TaskGraph` and `DependencyResolver`, and the execution lock serializes
//! all of them, so a task can be handed to at most one live lease.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use super::RetryPolicy;
use crate::domain::{
    Capability, ExecutionId, GraphError, Lease, LeaseEnd, LeaseToken, SchedulerError, Task,
    TaskId, TaskState, WorkerId,
};
use crate::graph::{DependencyResolver, TaskGraph};

/// Ready-set ordering: highest priority first, then insertion position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyKey {
    priority: Reverse<u8>,
    position: usize,
}

/// Backoff entry. Reverse ordering so `BinaryHeap` pops the earliest first.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    not_before: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .not_before
            .cmp(&self.not_before)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// What a worker receives from a successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    pub description: String,
    pub required_capability: Capability,
    pub priority: u8,

    /// 1 on the first lease of the task.
    pub attempt: u32,

    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

/// What happened to a task when its lease ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Completed; `released` are dependents that became Ready.
    Completed { released: Vec<TaskId> },

    /// Back to Pending. Ready again at `not_before` (which may be now).
    Retrying { not_before: DateTime<Utc> },

    /// Failed for good; `abandoned` are the dependents given up on.
    Failed { abandoned: Vec<TaskId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub lease: Lease,
    pub disposition: Disposition,
}

#[derive(Debug)]
pub struct DistributionQueue {
    execution_id: ExecutionId,
    lease_ttl: chrono::Duration,
    retry: RetryPolicy,

    ready: BTreeMap<ReadyKey, TaskId>,
    queued: HashMap<TaskId, ReadyKey>,

    leases: HashMap<LeaseToken, Lease>,
    by_task: HashMap<TaskId, LeaseToken>,

    /// Tokens that stopped being valid, and why.
    retired: HashMap<LeaseToken, LeaseEnd>,

    scheduled: BinaryHeap<ScheduledTask>,
}

impl DistributionQueue {
    pub fn new(execution_id: ExecutionId, lease_ttl: chrono::Duration, retry: RetryPolicy) -> Self {
        Self {
            execution_id,
            lease_ttl,
            retry,
            ready: BTreeMap::new(),
            queued: HashMap::new(),
            leases: HashMap::new(),
            by_task: HashMap::new(),
            retired: HashMap::new(),
            scheduled: BinaryHeap::new(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Insert a Ready task into the ready set.
    ///
    /// Idempotent: returns `false` if the task is already queued or is not
    /// Ready.
    pub fn enqueue(&mut self, graph: &TaskGraph, task_id: TaskId) -> Result<bool, GraphError> {
        let task = graph.get(task_id).ok_or(GraphError::UnknownTask(task_id))?;
        if task.state() != TaskState::Ready || self.queued.contains_key(&task_id) {
            return Ok(false);
        }

        let key = ReadyKey {
            priority: Reverse(task.priority()),
            position: graph.position(task_id).unwrap_or(usize::MAX),
        };
        self.ready.insert(key, task_id);
        self.queued.insert(task_id, key);
        Ok(true)
    }

    pub fn enqueue_all(
        &mut self,
        graph: &TaskGraph,
        task_ids: impl IntoIterator<Item = TaskId>,
    ) -> Result<usize, GraphError> {
        let mut added = 0;
        for task_id in task_ids {
            if self.enqueue(graph, task_id)? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn is_queued(&self, task_id: TaskId) -> bool {
        self.queued.contains_key(&task_id)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Gate a Pending task until `not_before`.
    pub(crate) fn schedule(&mut self, task_id: TaskId, not_before: DateTime<Utc>) {
        self.scheduled.push(ScheduledTask {
            not_before,
            task_id,
        });
    }

    /// Earliest backoff deadline, if any task is waiting on one.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.scheduled.peek().map(|entry| entry.not_before)
    }

    /// Move backoff entries whose time has come into the ready set.
    pub fn promote_due(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &DependencyResolver,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, GraphError> {
        let mut promoted = Vec::new();
        while let Some(entry) = self.scheduled.peek() {
            if entry.not_before > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if resolver.promote_if_ready(graph, entry.task_id, now)? {
                self.enqueue(graph, entry.task_id)?;
                promoted.push(entry.task_id);
            }
        }
        Ok(promoted)
    }

    /// Lease the first ready task `capabilities` can perform.
    pub fn claim(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &DependencyResolver,
        worker_id: &WorkerId,
        capabilities: &BTreeSet<Capability>,
        nonce: Ulid,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedTask>, GraphError> {
        self.promote_due(graph, resolver, now)?;

        let found = self
            .ready
            .iter()
            .find(|(_, task_id)| {
                graph
                    .get(**task_id)
                    .is_some_and(|task| capabilities.contains(task.required_capability()))
            })
            .map(|(key, task_id)| (*key, *task_id));
        let Some((key, task_id)) = found else {
            return Ok(None);
        };

        self.ready.remove(&key);
        self.queued.remove(&task_id);
        graph.apply_transition(task_id, TaskState::Leased)?;

        let lease = Lease {
            token: LeaseToken::new(self.execution_id, nonce),
            task_id,
            worker_id: worker_id.clone(),
            expires_at: now + self.lease_ttl,
        };
        self.by_task.insert(task_id, lease.token);
        self.leases.insert(lease.token, lease.clone());

        let task = graph.get(task_id).ok_or(GraphError::UnknownTask(task_id))?;
        debug!(
            execution_id = %self.execution_id,
            task_id = %task_id,
            worker_id = %worker_id,
            attempt = task.attempt(),
            "task leased"
        );

        Ok(Some(ClaimedTask {
            execution_id: self.execution_id,
            task_id,
            description: task.description().to_string(),
            required_capability: task.required_capability().clone(),
            priority: task.priority(),
            attempt: task.attempt(),
            token: lease.token,
            expires_at: lease.expires_at,
        }))
    }

    pub fn lease(&self, token: &LeaseToken) -> Result<&Lease, SchedulerError> {
        self.leases.get(token).ok_or_else(|| self.stale(token))
    }

    pub fn lease_for(&self, task_id: TaskId) -> Option<&Lease> {
        self.by_task.get(&task_id).and_then(|t| self.leases.get(t))
    }

    /// Live leases, oldest token first.
    pub fn leases(&self) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self.leases.values().cloned().collect();
        leases.sort_by_key(|l| l.token);
        leases
    }

    /// Push a live lease's deadline to `now + lease_ttl`.
    pub fn renew(
        &mut self,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.ensure_live(token, now)?;
        let ttl = self.lease_ttl;
        let lease = self
            .leases
            .get_mut(token)
            .ok_or(SchedulerError::LeaseNotFound)?;
        lease.expires_at = now + ttl;
        Ok(lease.expires_at)
    }

    /// `Leased -> Completed`; dependents whose last dependency this was are
    /// enqueued.
    pub fn complete(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &mut DependencyResolver,
        token: &LeaseToken,
        result: String,
        now: DateTime<Utc>,
    ) -> Result<Release, SchedulerError> {
        self.ensure_live(token, now)?;
        let lease = self.take(token, LeaseEnd::Finished)?;

        graph.complete(lease.task_id, result)?;
        let released = resolver.on_completed(graph, lease.task_id, now)?;
        self.enqueue_all(graph, released.iter().copied())?;

        debug!(
            execution_id = %self.execution_id,
            task_id = %lease.task_id,
            worker_id = %lease.worker_id,
            released = released.len(),
            "task completed"
        );
        Ok(Release {
            lease,
            disposition: Disposition::Completed { released },
        })
    }

    /// Report a failed attempt. Retryable failures back off while attempts
    /// remain; anything else fails the task and abandons its dependents.
    pub fn fail(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &mut DependencyResolver,
        token: &LeaseToken,
        reason: String,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Release, SchedulerError> {
        self.ensure_live(token, now)?;
        let lease = self.take(token, LeaseEnd::Finished)?;
        let disposition =
            self.retry_or_fail(graph, resolver, lease.task_id, reason, retryable, true, now)?;
        Ok(Release { lease, disposition })
    }

    /// Reclaim a lease as if it had expired, regardless of its deadline.
    ///
    /// Returns `None` if the token is not live. Expiry requeues without
    /// backoff but still counts toward `max_attempts`.
    pub fn force_expire(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &mut DependencyResolver,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Release>, SchedulerError> {
        if !self.leases.contains_key(token) {
            return Ok(None);
        }
        let lease = self.take(token, LeaseEnd::Expired)?;
        warn!(
            execution_id = %self.execution_id,
            task_id = %lease.task_id,
            worker_id = %lease.worker_id,
            "lease expired"
        );
        let reason = format!("lease expired on worker {}", lease.worker_id);
        let disposition =
            self.retry_or_fail(graph, resolver, lease.task_id, reason, true, false, now)?;
        Ok(Some(Release { lease, disposition }))
    }

    /// Expire every lease past its deadline, earliest deadline first.
    pub fn sweep_expired(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &mut DependencyResolver,
        now: DateTime<Utc>,
    ) -> Result<Vec<Release>, SchedulerError> {
        let mut expired: Vec<(DateTime<Utc>, LeaseToken)> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| (lease.expires_at, lease.token))
            .collect();
        expired.sort();

        let mut released = Vec::with_capacity(expired.len());
        for (_, token) in expired {
            if let Some(release) = self.force_expire(graph, resolver, &token, now)? {
                released.push(release);
            }
        }
        Ok(released)
    }

    /// Drop everything: live leases are retired as cancelled and returned.
    pub fn cancel(&mut self) -> Vec<Lease> {
        let mut dropped: Vec<Lease> = self.leases.drain().map(|(_, lease)| lease).collect();
        dropped.sort_by_key(|l| l.token);
        for lease in &dropped {
            self.retired.insert(lease.token, LeaseEnd::Cancelled);
        }
        self.by_task.clear();
        self.ready.clear();
        self.queued.clear();
        self.scheduled.clear();
        dropped
    }

    /// Reinstate a lease from a snapshot.
    pub(crate) fn restore_lease(&mut self, lease: Lease) {
        self.by_task.insert(lease.task_id, lease.token);
        self.leases.insert(lease.token, lease);
    }

    fn ensure_live(&self, token: &LeaseToken, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        if self.lease(token)?.is_expired(now) {
            return Err(SchedulerError::LeaseExpired);
        }
        Ok(())
    }

    fn stale(&self, token: &LeaseToken) -> SchedulerError {
        match self.retired.get(token) {
            Some(LeaseEnd::Expired) => SchedulerError::LeaseExpired,
            Some(LeaseEnd::Cancelled) => SchedulerError::ExecutionCancelled(self.execution_id),
            Some(LeaseEnd::Finished) | None => SchedulerError::LeaseNotFound,
        }
    }

    fn take(&mut self, token: &LeaseToken, end: LeaseEnd) -> Result<Lease, SchedulerError> {
        let Some(lease) = self.leases.remove(token) else {
            return Err(self.stale(token));
        };
        self.by_task.remove(&lease.task_id);
        self.retired.insert(*token, end);
        Ok(lease)
    }

    #[allow(clippy::too_many_arguments)]
    fn retry_or_fail(
        &mut self,
        graph: &mut TaskGraph,
        resolver: &mut DependencyResolver,
        task_id: TaskId,
        reason: String,
        retryable: bool,
        backoff: bool,
        now: DateTime<Utc>,
    ) -> Result<Disposition, GraphError> {
        let attempt = graph
            .get(task_id)
            .map(Task::attempt)
            .ok_or(GraphError::UnknownTask(task_id))?;

        if !retryable || !self.retry.allows_retry(attempt) {
            warn!(
                execution_id = %self.execution_id,
                task_id = %task_id,
                attempt,
                retryable,
                reason = %reason,
                "task failed"
            );
            graph.fail(task_id, reason)?;
            let abandoned = resolver.on_failed(graph, task_id)?;
            return Ok(Disposition::Failed { abandoned });
        }

        let delay = if backoff {
            self.retry.next_delay(attempt)
        } else {
            std::time::Duration::ZERO
        };
        if delay.is_zero() {
            graph.requeue(task_id, None, reason)?;
            if resolver.promote_if_ready(graph, task_id, now)? {
                self.enqueue(graph, task_id)?;
            }
            return Ok(Disposition::Retrying { not_before: now });
        }

        let not_before = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(
            execution_id = %self.execution_id,
            task_id = %task_id,
            attempt,
            %not_before,
            "task backing off"
        );
        graph.requeue(task_id, Some(not_before), reason)?;
        self.schedule(task_id, not_before);
        Ok(Disposition::Retrying { not_before })
    }
}
