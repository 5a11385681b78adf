//! Lease expiry, lost workers and snapshot restore.

mod common;

use std::sync::Arc;

use chrono::Duration;
use conductor_core::domain::{ExecutionPhase, LeaseToken, SchedulerError, TaskState, WorkerStatus};
use conductor_core::impls::{InMemoryEventSink, StaticDecomposer};
use conductor_core::orchestrator::{SchedulerSnapshot, SweepReport};
use conductor_core::ports::ManualClock;
use conductor_core::{SchedulerBuilder, SchedulerConfig};
use ulid::Ulid;

use common::{Harness, decomposition, t0, task_ids};

#[tokio::test]
async fn expired_lease_is_reclaimed_by_sweep() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    let w1 = h.worker("w1", &["work"]).await;
    let w2 = h.worker("w2", &["work"]).await;
    let id = h.scheduler.submit_execution("slow").await.unwrap();
    let ids = task_ids(&h.scheduler, id).await;

    let first = h.claim(&w1).await.unwrap();
    assert_eq!(first.expires_at, t0() + Duration::seconds(30));

    h.advance(Duration::seconds(10));
    h.scheduler.heartbeat(&w1).await.unwrap();
    h.scheduler.heartbeat(&w2).await.unwrap();
    assert_eq!(h.scheduler.sweep().await, SweepReport::default());

    h.advance(Duration::seconds(10));
    h.scheduler.heartbeat(&w1).await.unwrap();
    h.scheduler.heartbeat(&w2).await.unwrap();
    h.advance(Duration::seconds(10));
    h.scheduler.heartbeat(&w1).await.unwrap();
    h.scheduler.heartbeat(&w2).await.unwrap();

    let report = h.scheduler.sweep().await;
    assert_eq!(report.expired_leases, 1);
    assert_eq!(report.unreachable_workers, 0);

    let status = h.scheduler.get_execution_status(id).await.unwrap();
    assert_eq!(status.task(ids[0]).unwrap().state, TaskState::Ready);
    assert!(status.leases.is_empty());
    assert_eq!(h.scheduler.worker(&w1).await.unwrap().status, WorkerStatus::Idle);

    assert!(matches!(
        h.scheduler.report_completion(&first.token, "late").await,
        Err(SchedulerError::LeaseExpired)
    ));

    let second = h.claim(&w2).await.unwrap();
    assert_eq!(second.task_id, ids[0]);
    assert_eq!(second.attempt, 2);
    assert_ne!(second.token, first.token);
}

#[tokio::test]
async fn renewal_keeps_a_lease_alive() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    let w = h.worker("w1", &["work"]).await;
    let id = h.scheduler.submit_execution("long").await.unwrap();

    let claimed = h.claim(&w).await.unwrap();
    for _ in 0..5 {
        h.advance(Duration::seconds(10));
        let expires_at = h.scheduler.renew_lease(&claimed.token).await.unwrap();
        assert_eq!(expires_at, h.clock_now() + Duration::seconds(30));
        assert_eq!(h.scheduler.sweep().await, SweepReport::default());
    }

    h.scheduler
        .report_completion(&claimed.token, "finally")
        .await
        .unwrap();
    let status = h.scheduler.get_execution_status(id).await.unwrap();
    assert_eq!(status.phase, ExecutionPhase::Succeeded);
}

#[tokio::test]
async fn expired_lease_is_rejected_even_before_a_sweep() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    let w = h.worker("w1", &["work"]).await;
    h.scheduler.submit_execution("late").await.unwrap();

    let claimed = h.claim(&w).await.unwrap();
    h.advance(Duration::seconds(31));

    assert!(matches!(
        h.scheduler.renew_lease(&claimed.token).await,
        Err(SchedulerError::LeaseExpired)
    ));
}

#[tokio::test]
async fn silent_worker_loses_its_leases() {
    let h = Harness::with_defaults(decomposition(&[("a", "work"), ("b", "work")], &[]));
    let w1 = h.worker("w1", &["work"]).await;
    let w2 = h.worker("w2", &["work"]).await;
    let id = h.scheduler.submit_execution("crash").await.unwrap();

    let lost = h.claim(&w1).await.unwrap();
    let kept = h.claim(&w2).await.unwrap();

    h.advance(Duration::seconds(10));
    h.scheduler.renew_lease(&kept.token).await.unwrap();
    h.advance(Duration::seconds(6));

    let report = h.scheduler.sweep().await;
    assert_eq!(report.unreachable_workers, 1);
    assert_eq!(report.expired_leases, 1);
    assert_eq!(
        h.scheduler.worker(&w1).await.unwrap().status,
        WorkerStatus::Unreachable
    );
    assert!(matches!(
        h.scheduler.claim_task(&w1).await,
        Err(SchedulerError::WorkerUnreachable(_))
    ));
    assert!(h.scheduler.report_completion(&lost.token, "zombie").await.is_err());

    // the reclaimed task goes to the surviving worker
    let retried = h.claim(&w2).await.unwrap();
    assert_eq!(retried.task_id, lost.task_id);
    assert_eq!(retried.attempt, 2);

    h.scheduler.report_completion(&kept.token, "ok").await.unwrap();
    h.scheduler.report_completion(&retried.token, "ok").await.unwrap();
    assert_eq!(
        h.scheduler.get_execution_status(id).await.unwrap().phase,
        ExecutionPhase::Succeeded
    );

    // a heartbeat brings the worker back
    h.scheduler.heartbeat(&w1).await.unwrap();
    assert_eq!(h.scheduler.worker(&w1).await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test]
async fn deregistering_a_worker_requeues_its_task() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    let w1 = h.worker("w1", &["work"]).await;
    let w2 = h.worker("w2", &["work"]).await;
    h.scheduler.submit_execution("leave").await.unwrap();

    let claimed = h.claim(&w1).await.unwrap();
    h.scheduler.deregister_worker(&w1).await.unwrap();
    assert!(h.scheduler.worker(&w1).await.is_none());

    let retried = h.claim(&w2).await.unwrap();
    assert_eq!(retried.task_id, claimed.task_id);
    assert!(matches!(
        h.scheduler.deregister_worker(&w1).await,
        Err(SchedulerError::UnknownWorker(_))
    ));
}

#[tokio::test]
async fn exhausting_attempts_through_expiry_fails_the_task() {
    let config = SchedulerConfig {
        retry: conductor_core::config::RetryConfig {
            max_attempts: 2,
            ..Default::default()
        },
        ..SchedulerConfig::default()
    };
    let h = Harness::new(config, decomposition(&[("a", "work")], &[]));
    let w = h.worker("w1", &["work"]).await;
    let id = h.scheduler.submit_execution("doomed").await.unwrap();

    for _ in 0..2 {
        h.claim(&w).await.unwrap();
        h.advance(Duration::seconds(31));
        h.scheduler.heartbeat(&w).await.unwrap();
        h.scheduler.sweep().await;
    }

    let status = h.scheduler.get_execution_status(id).await.unwrap();
    assert_eq!(status.phase, ExecutionPhase::PartiallyFailed);
    assert_eq!(status.counts.failed, 1);
    assert!(h.claim(&w).await.is_none());
}

#[tokio::test]
async fn snapshot_restores_into_a_fresh_scheduler() {
    let h = Harness::with_defaults(decomposition(
        &[("a", "work"), ("b", "work"), ("c", "work")],
        &[(0, 2), (1, 2)],
    ));
    let w = h.worker("w1", &["work"]).await;
    let id = h.scheduler.submit_execution("persist").await.unwrap();
    let ids = task_ids(&h.scheduler, id).await;

    let a = h.claim(&w).await.unwrap();
    h.scheduler.report_completion(&a.token, "a done").await.unwrap();
    let b = h.claim(&w).await.unwrap();

    let json = h.scheduler.snapshot().await.to_json().unwrap();
    let snapshot = SchedulerSnapshot::from_json(&json).unwrap();
    assert_eq!(snapshot.executions.len(), 1);
    assert_eq!(snapshot.workers.len(), 1);

    let clock = Arc::new(ManualClock::new(t0() + Duration::seconds(5)));
    let restored = SchedulerBuilder::new()
        .clock(clock.clone())
        .events(Arc::new(InMemoryEventSink::new()))
        .decomposer(StaticDecomposer::new(decomposition(&[("x", "work")], &[])))
        .build()
        .unwrap();
    restored.restore(snapshot).await.unwrap();

    assert_eq!(restored.executions().await, vec![id]);
    let status = restored.get_execution_status(id).await.unwrap();
    assert_eq!(status.task(ids[0]).unwrap().state, TaskState::Completed);
    assert_eq!(status.task(ids[0]).unwrap().result.as_deref(), Some("a done"));
    assert_eq!(status.task(b.task_id).unwrap().state, TaskState::Leased);
    assert_eq!(status.leases.len(), 1);

    // the outstanding token survives the restart
    restored.report_completion(&b.token, "b done").await.unwrap();
    let c = restored.claim_task(&w).await.unwrap().unwrap();
    assert_eq!(c.task_id, ids[2]);
    restored.report_completion(&c.token, "c done").await.unwrap();
    assert_eq!(
        restored.get_execution_status(id).await.unwrap().phase,
        ExecutionPhase::Succeeded
    );
}

#[tokio::test]
async fn restored_workers_get_a_fresh_heartbeat_window() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    h.worker("w1", &["work"]).await;
    let snapshot = h.scheduler.snapshot().await;

    let clock = Arc::new(ManualClock::new(t0() + Duration::hours(1)));
    let restored = SchedulerBuilder::new()
        .clock(clock.clone())
        .decomposer(StaticDecomposer::new(decomposition(&[("a", "work")], &[])))
        .build()
        .unwrap();
    restored.restore(snapshot).await.unwrap();

    assert_eq!(restored.sweep().await.unreachable_workers, 0);
    clock.advance(Duration::seconds(16));
    assert_eq!(restored.sweep().await.unreachable_workers, 1);
}

#[tokio::test]
async fn a_failed_reclaim_does_not_strand_other_leases() {
    let h = Harness::with_defaults(decomposition(&[("a", "work")], &[]));
    let w = h.worker("w1", &["work"]).await;
    let broken = h.scheduler.submit_execution("broken").await.unwrap();
    h.advance(Duration::milliseconds(1));
    let healthy = h.scheduler.submit_execution("healthy").await.unwrap();

    let first = h.claim(&w).await.unwrap();
    let second = h.claim(&w).await.unwrap();
    assert_eq!(first.execution_id, broken);
    assert_eq!(second.execution_id, healthy);

    // A second lease on the same task: reclaiming it after the first one
    // is an invalid transition.
    let mut snapshot = h.scheduler.snapshot().await;
    let exec = snapshot
        .executions
        .iter_mut()
        .find(|e| e.execution_id == broken)
        .unwrap();
    let mut duplicate = exec.leases[0].clone();
    duplicate.token = LeaseToken::new(broken, Ulid::new());
    exec.leases.push(duplicate.clone());
    snapshot.workers[0].held_leases.insert(duplicate.token);

    let clock = Arc::new(ManualClock::new(h.clock_now()));
    let restored = SchedulerBuilder::new()
        .clock(clock.clone())
        .decomposer(StaticDecomposer::new(decomposition(&[("a", "work")], &[])))
        .build()
        .unwrap();
    restored.restore(snapshot).await.unwrap();

    clock.advance(Duration::seconds(16));
    let report = restored.sweep().await;
    assert_eq!(report.unreachable_workers, 1);
    assert_eq!(report.expired_leases, 2);

    for id in [broken, healthy] {
        let status = restored.get_execution_status(id).await.unwrap();
        assert!(status.leases.is_empty());
        assert_eq!(status.tasks[0].state, TaskState::Ready);
    }
    assert!(matches!(
        restored.report_completion(&second.token, "late").await,
        Err(SchedulerError::LeaseExpired)
    ));
}
