mod common;

use common::{BreakableLeaseStore, JOB, NAMESPACE, REPOSITORY, ScriptedEngine, config, seed};
use restoregate::events::InMemoryEventSink;
use restoregate::metrics::InMemoryMetricsReporter;
use restoregate::lease::restore_lock_key;
use restoregate::{
    EventReason, ExecutionMode, HostRestorePhase, InMemoryStateStore, LeaseStore, Repository,
    RestoreCoordinator, RestoreError, RestoreJob, RestoreOutcome, RestorePhase,
    RestoreStateClient, RestoreTarget, TargetKind, exit_code,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_test::{assert_err, assert_ok};

fn coordinator(
    store: &InMemoryStateStore,
    pod_name: &str,
    engine: Arc<ScriptedEngine>,
    events: &InMemoryEventSink,
) -> RestoreCoordinator {
    RestoreCoordinator::new(
        config(pod_name),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        engine,
    )
    .events(Arc::new(events.clone()))
}

fn deployment() -> RestoreTarget {
    RestoreTarget::new(TargetKind::Deployment, "web")
}

#[tokio::test]
async fn successful_restore_marks_the_job_succeeded() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let events = InMemoryEventSink::new();
    let engine = Arc::new(ScriptedEngine::succeeding(1024));

    let result = coordinator(&store, "web-5d8f7-abcde", engine.clone(), &events)
        .run()
        .await;
    assert_eq!(exit_code(&result), 0);
    let report = assert_ok!(result);
    assert_eq!(report.hostname, "host-0");
    assert!(matches!(
        report.outcome,
        RestoreOutcome::Recorded { phase: RestorePhase::Succeeded, .. }
    ));

    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert_eq!(job.status.phase, RestorePhase::Succeeded);
    assert_eq!(job.status.stats.len(), 1);
    assert_eq!(job.status.stats[0].hostname, "host-0");
    assert_eq!(job.status.stats[0].phase, HostRestorePhase::Succeeded);
    assert_eq!(job.status.stats[0].bytes_restored, Some(1024));
    assert_eq!(job.status.total_hosts, Some(1));
    assert!(job.status.session_duration.is_some());
    assert!(job.creation_timestamp.is_some());
    assert_eq!(engine.calls(), 1);

    assert_eq!(
        events.reasons().await,
        vec![EventReason::HostRestoreSucceeded, EventReason::RestoreSessionSucceeded]
    );

    let lock = store
        .get_lock(NAMESPACE, &restore_lock_key(&deployment().reference))
        .await
        .unwrap()
        .unwrap();
    assert!(lock.record.is_released());
}

#[tokio::test]
async fn engine_failure_is_recorded_before_the_error_is_returned() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let events = InMemoryEventSink::new();
    let engine = Arc::new(ScriptedEngine::failing("repository locked"));

    let result = coordinator(&store, "web-0", engine.clone(), &events).run().await;
    assert_eq!(exit_code(&result), 1);
    let err = assert_err!(result);
    assert!(matches!(err, RestoreError::Transfer(ref msg) if msg == "repository locked"));

    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert_eq!(job.status.phase, RestorePhase::Failed);
    let stat = job.status.stat_for("host-0").unwrap();
    assert_eq!(stat.phase, HostRestorePhase::Failed);
    assert_eq!(stat.error.as_deref(), Some("repository locked"));

    let reasons = events.reasons().await;
    assert!(reasons.contains(&EventReason::HostRestoreFailed));
    assert!(reasons.contains(&EventReason::RestoreSessionFailed));

    let lock = store
        .get_lock(NAMESPACE, &restore_lock_key(&deployment().reference))
        .await
        .unwrap()
        .unwrap();
    assert!(lock.record.is_released());
}

#[tokio::test]
async fn later_contender_after_success_is_a_no_op() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let events = InMemoryEventSink::new();

    let first = Arc::new(ScriptedEngine::succeeding(1024));
    assert_ok!(coordinator(&store, "web-a", first, &events).run().await);
    let writes = store.status_writes().await;

    let second = Arc::new(ScriptedEngine::succeeding(1024));
    let report = assert_ok!(coordinator(&store, "web-b", second.clone(), &events).run().await);
    assert_eq!(report.outcome, RestoreOutcome::Skipped);
    assert_eq!(second.calls(), 0);
    assert_eq!(store.status_writes().await, writes);
}

#[tokio::test]
async fn restart_after_failure_does_not_retry_the_transfer() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let events = InMemoryEventSink::new();

    let failing = Arc::new(ScriptedEngine::failing("repository locked"));
    assert_err!(coordinator(&store, "web-0", failing, &events).run().await);

    let restarted = Arc::new(ScriptedEngine::succeeding(1));
    let report = assert_ok!(coordinator(&store, "web-0", restarted.clone(), &events).run().await);
    assert_eq!(report.outcome, RestoreOutcome::Skipped);
    assert_eq!(restarted.calls(), 0);
    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert_eq!(job.status.phase, RestorePhase::Failed);
}

#[tokio::test]
async fn missing_target_fails_before_touching_the_lock() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let mut job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    job.spec.target = None;
    store.put_restore_job(job).await;

    let engine = Arc::new(ScriptedEngine::succeeding(1));
    let err = assert_err!(
        coordinator(&store, "web-0", engine.clone(), &InMemoryEventSink::new())
            .run()
            .await
    );
    assert!(err.is_fatal_config());
    assert_eq!(err.to_string(), "Configuration error: invalid RestoreJob demo/restore-db. Target is nil");
    assert!(
        store
            .get_lock(NAMESPACE, &restore_lock_key(&deployment().reference))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(store.status_writes().await, 0);
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn unreachable_lease_backend_fails_without_touching_status() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let leases = BreakableLeaseStore::new(store.clone());
    leases.unreachable.store(true, Ordering::SeqCst);
    let events = InMemoryEventSink::new();
    let engine = Arc::new(ScriptedEngine::succeeding(1));

    let result = RestoreCoordinator::new(
        config("web-0"),
        Arc::new(store.clone()),
        Arc::new(leases),
        engine.clone(),
    )
    .events(Arc::new(events.clone()))
    .run()
    .await;
    assert_eq!(exit_code(&result), 1);
    let err = assert_err!(result);
    assert!(matches!(err, RestoreError::Lock(_)), "got {err:?}");
    assert!(err.to_string().contains("lease api unreachable"));

    assert_eq!(store.status_writes().await, 0);
    assert_eq!(engine.calls(), 0);
    assert!(events.events().await.is_empty());
    assert!(
        store
            .get_lock(NAMESPACE, &restore_lock_key(&deployment().reference))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn repository_without_backend_is_a_configuration_error() {
    let store = InMemoryStateStore::new();
    store
        .put_repository(Repository::new(NAMESPACE, REPOSITORY, ""))
        .await;
    store
        .put_restore_job(RestoreJob::new(NAMESPACE, JOB, deployment(), REPOSITORY))
        .await;

    let err = assert_err!(
        coordinator(
            &store,
            "web-0",
            Arc::new(ScriptedEngine::succeeding(1)),
            &InMemoryEventSink::new()
        )
        .run()
        .await
    );
    assert!(err.is_fatal_config());
    assert_eq!(store.status_writes().await, 0);
}

#[tokio::test]
async fn non_exclusive_mode_runs_without_the_mutex() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let engine = Arc::new(ScriptedEngine::succeeding(10));

    let coordinator = RestoreCoordinator::new(
        config("restore-job-xyz").mode(ExecutionMode::NonExclusive),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        engine.clone(),
    );
    assert_ok!(coordinator.run().await);
    assert_eq!(engine.calls(), 1);
    assert!(
        store
            .get_lock(NAMESPACE, &restore_lock_key(&deployment().reference))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn statefulset_job_succeeds_once_every_replica_reported() {
    let store = InMemoryStateStore::new();
    seed(&store, RestoreTarget::new(TargetKind::StatefulSet, "db").with_replicas(3)).await;
    let events = InMemoryEventSink::new();
    let engine = Arc::new(ScriptedEngine::succeeding(64));

    let mut phases = Vec::new();
    for pod in ["db-2", "db-0", "db-1"] {
        let report = assert_ok!(coordinator(&store, pod, engine.clone(), &events).run().await);
        match report.outcome {
            RestoreOutcome::Recorded { phase, .. } => phases.push(phase),
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(
        phases,
        vec![RestorePhase::Pending, RestorePhase::Pending, RestorePhase::Succeeded]
    );

    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    let mut hosts = job
        .status
        .stats
        .iter()
        .map(|s| s.hostname.as_str())
        .collect::<Vec<_>>();
    hosts.sort();
    assert_eq!(hosts, vec!["host-0", "host-1", "host-2"]);
    assert_eq!(engine.calls(), 3);
}

#[tokio::test]
async fn one_failed_replica_fails_the_job_and_blocks_the_rest() {
    let store = InMemoryStateStore::new();
    seed(&store, RestoreTarget::new(TargetKind::StatefulSet, "db").with_replicas(3)).await;
    let events = InMemoryEventSink::new();

    let ok = Arc::new(ScriptedEngine::succeeding(1));
    assert_ok!(coordinator(&store, "db-0", ok.clone(), &events).run().await);
    let failing = Arc::new(ScriptedEngine::failing("snapshot not found"));
    assert_err!(coordinator(&store, "db-1", failing, &events).run().await);
    let report = assert_ok!(coordinator(&store, "db-2", ok.clone(), &events).run().await);

    assert_eq!(report.outcome, RestoreOutcome::Skipped);
    assert_eq!(ok.calls(), 1);
    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert_eq!(job.status.phase, RestorePhase::Failed);
    assert_eq!(job.status.stats.len(), 2);
    assert!(job.status.stat_for("host-2").is_none());
}

#[tokio::test]
async fn recorded_failure_is_reported_as_metrics() {
    let store = InMemoryStateStore::new();
    seed(&store, deployment()).await;
    let metrics = InMemoryMetricsReporter::new();
    let engine = Arc::new(ScriptedEngine::failing("snapshot not found"));

    let err = assert_err!(
        coordinator(&store, "web-0", engine, &InMemoryEventSink::new())
            .metrics(Arc::new(metrics.clone()))
            .run()
            .await
    );
    assert!(matches!(err, RestoreError::Transfer(_)));

    let hosts = metrics.hosts().await;
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].hostname, "host-0");
    assert_eq!(hosts[0].phase, HostRestorePhase::Failed);
    let sessions = metrics.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].phase, RestorePhase::Failed);
    assert_eq!(sessions[0].failed_hosts, 1);

    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert!(job.status.session_duration.is_some());
}
