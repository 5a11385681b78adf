//! WorkerGroup - in-process workers that claim, run and report tasks.
//!
//! Flow per worker:
//! 1. `claim_task_wait` (doubles as a heartbeat)
//! 2. run the handler, renewing the lease every `renew_every`
//! 3. report completion or failure
//!
//! If a renewal comes back stale the handler future is dropped and the worker
//! goes back to claiming.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::runtime::{HandlerError, Runtime};
use crate::config::SchedulerConfig;
use crate::domain::WorkerId;
use crate::orchestrator::Scheduler;
use crate::queue::ClaimedTask;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// How long one claim waits for work before checking for shutdown.
    pub poll: Duration,

    /// Renewal period while a handler runs; keep it well under the lease TTL.
    pub renew_every: Duration,
}

impl WorkerOptions {
    /// Renew, and poll while idle, at a third of the shorter of the lease TTL
    /// and the heartbeat timeout. Renewals and claims are the only heartbeats
    /// a worker sends.
    pub fn for_config(config: &SchedulerConfig) -> Self {
        let cadence = (config.lease_ttl().min(config.heartbeat_timeout()) / 3)
            .max(Duration::from_millis(1));
        Self {
            poll: cadence.min(Duration::from_millis(250)),
            renew_every: cadence,
        }
    }
}

/// Worker group handle.
/// - dropping or signalling `shutdown_tx` stops every worker between tasks
/// - `shutdown_and_join()` waits for all of them
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Register and spawn one worker per id, each offering every capability
    /// the runtime has a handler for.
    pub async fn spawn(
        worker_ids: Vec<WorkerId>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<Runtime>,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let capabilities = runtime.registry().capabilities();

        let mut joins = Vec::with_capacity(worker_ids.len());
        for worker_id in worker_ids {
            scheduler
                .register_worker(worker_id.clone(), capabilities.iter().cloned())
                .await;

            let scheduler = Arc::clone(&scheduler);
            let runtime = Arc::clone(&runtime);
            let options = options.clone();
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, scheduler, runtime, options, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new leases. In-flight handlers finish and report first.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: WorkerId,
    scheduler: Arc<Scheduler>,
    runtime: Arc<Runtime>,
    options: WorkerOptions,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let claimed = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    // group dropped
                    break;
                }
                continue;
            }
            claimed = scheduler.claim_task_wait(&worker_id, options.poll) => claimed,
        };

        let task = match claimed {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(err) => {
                // unreachable or unknown: heartbeat brings us back
                warn!(worker_id = %worker_id, error = %err, "claim refused");
                if scheduler.heartbeat(&worker_id).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let Some(outcome) = run_with_renewal(&scheduler, &runtime, &task, &options).await else {
            continue;
        };

        let reported = match outcome {
            Ok(result) => scheduler.report_completion(&task.token, result).await,
            Err(err) => {
                scheduler
                    .report_failure(&task.token, err.message, err.retryable)
                    .await
            }
        };
        if let Err(err) = reported {
            if err.is_stale_lease() {
                debug!(worker_id = %worker_id, task_id = %task.task_id, error = %err, "report dropped");
            } else {
                warn!(worker_id = %worker_id, task_id = %task.task_id, error = %err, "report failed");
            }
        }
    }
}

/// Run the handler while renewing its lease. `None` if the lease was lost.
async fn run_with_renewal(
    scheduler: &Scheduler,
    runtime: &Runtime,
    task: &ClaimedTask,
    options: &WorkerOptions,
) -> Option<Result<String, HandlerError>> {
    let handler = runtime.execute(task);
    tokio::pin!(handler);

    let mut ticker = tokio::time::interval(options.renew_every);
    ticker.tick().await;

    loop {
        tokio::select! {
            outcome = &mut handler => return Some(outcome),
            _ = ticker.tick() => {
                if let Err(err) = scheduler.renew_lease(&task.token).await {
                    debug!(task_id = %task.task_id, error = %err, "lease lost; dropping task");
                    return None;
                }
            }
        }
    }
}
