//! SweeperLoop - periodic heartbeat detection and lease expiry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::orchestrator::Scheduler;

pub struct SweeperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SweeperLoop {
    /// Sweep every `interval` until shut down.
    pub fn spawn(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = scheduler.sweep().await;
                        if report.expired_leases > 0 || report.unreachable_workers > 0 {
                            debug!(?report, "sweep");
                        }
                    }
                }
            }
        });

        Self { shutdown_tx, join }
    }

    /// Sweep at the configured `sweep_interval`.
    pub fn spawn_configured(scheduler: Arc<Scheduler>) -> Self {
        let interval = scheduler.config().sweep_interval();
        Self::spawn(scheduler, interval)
    }

    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, Decomposition, ExecutionPhase, TaskSpec, TaskState, WorkerId};
    use crate::impls::StaticDecomposer;
    use crate::orchestrator::SchedulerBuilder;
    use crate::config::SchedulerConfig;

    #[tokio::test]
    async fn reclaims_abandoned_lease() {
        let config = SchedulerConfig {
            lease_ttl_ms: 50,
            sweep_interval_ms: Some(10),
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(
            SchedulerBuilder::new()
                .config(config)
                .decomposer(StaticDecomposer::new(Decomposition::new(
                    vec![TaskSpec::new("t", "work")],
                    vec![],
                )))
                .build()
                .unwrap(),
        );
        let worker = WorkerId::new("w1");
        scheduler
            .register_worker(worker.clone(), [Capability::from("work")])
            .await;
        let id = scheduler.submit_execution("x").await.unwrap();
        let first = scheduler.claim_task(&worker).await.unwrap().unwrap();

        let sweeper = SweeperLoop::spawn_configured(scheduler.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        sweeper.shutdown_and_join().await;

        let status = scheduler.get_execution_status(id).await.unwrap();
        assert_eq!(status.phase, ExecutionPhase::Running);
        assert_eq!(status.task(first.task_id).unwrap().state, TaskState::Ready);
        assert!(status.leases.is_empty());
    }
}
