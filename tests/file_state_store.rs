mod common;

use common::{JOB, NAMESPACE, REPOSITORY, ScriptedEngine, config};
use futures::future::join_all;
use restoregate::core::LockRecord;
use restoregate::events::FileEventSink;
use restoregate::restore::{StatusSynchronizer, TargetReplicaTopology};
use restoregate::{
    EventReason, FileStateStore, HostRestoreStat, LeaseStore, Repository, RestoreCoordinator,
    RestoreEvent, RestoreJob, RestorePhase, RestoreStateClient, RestoreTarget,
    StatusRetryPolicy, TargetKind,
};
use std::sync::Arc;
use tempfile::tempdir;
use tokio_test::assert_ok;

fn job() -> RestoreJob {
    RestoreJob::new(
        NAMESPACE,
        JOB,
        RestoreTarget::new(TargetKind::StatefulSet, "db").with_replicas(4),
        REPOSITORY,
    )
}

#[tokio::test]
async fn documents_are_versioned_and_stale_writes_conflict() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path());

    let stored = store.put_restore_job(job()).await.unwrap();
    assert_eq!(stored.resource_version, 1);
    assert!(dir.path().join(NAMESPACE).join("restorejobs").join(format!("{JOB}.json")).exists());

    let mut update = stored.clone();
    update.status.upsert_stat(HostRestoreStat::succeeded("host-0"));
    let updated = store.update_restore_job_status(&update).await.unwrap();
    assert_eq!(updated.resource_version, 2);

    let err = store.update_restore_job_status(&stored).await.unwrap_err();
    assert!(err.is_conflict());

    let reread = FileStateStore::new(dir.path())
        .get_restore_job(NAMESPACE, JOB)
        .await
        .unwrap();
    assert_eq!(reread, updated);
}

#[tokio::test]
async fn lock_creation_is_exclusive_across_store_instances() {
    let dir = tempdir().unwrap();
    let now = chrono::Utc::now();
    let record = LockRecord {
        holder_identity: "db-0".to_string(),
        lease_duration_ms: 15_000,
        acquire_time: now,
        renew_time: now,
        leader_transitions: 0,
    };

    let attempts = (0..4).map(|_| {
        let store = FileStateStore::new(dir.path());
        let record = record.clone();
        tokio::spawn(async move { store.create_lock(NAMESPACE, "restore-statefulset-db", record).await })
    });
    let created = join_all(attempts)
        .await
        .into_iter()
        .map(|task| task.unwrap())
        .filter(|result| result.is_ok())
        .count();
    assert_eq!(created, 1);

    let lock = FileStateStore::new(dir.path())
        .get_lock(NAMESPACE, "restore-statefulset-db")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lock.resource_version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_hosts_all_land_in_the_status() {
    let dir = tempdir().unwrap();
    FileStateStore::new(dir.path()).put_restore_job(job()).await.unwrap();
    let job_ref = job().job_ref();

    let updates = (0..4).map(|ordinal| {
        let sync = StatusSynchronizer::new(
            Arc::new(FileStateStore::new(dir.path())),
            Arc::new(restoregate::events::LogEventSink),
            Arc::new(TargetReplicaTopology),
            StatusRetryPolicy {
                max_attempts: 50,
                base_backoff_ms: 1,
                max_backoff_ms: 20,
            },
        );
        let job_ref = job_ref.clone();
        tokio::spawn(async move {
            sync.update(&job_ref, HostRestoreStat::succeeded(format!("host-{ordinal}")))
                .await
        })
    });
    for result in join_all(updates).await {
        result.unwrap().unwrap();
    }

    let stored = FileStateStore::new(dir.path())
        .get_restore_job(NAMESPACE, JOB)
        .await
        .unwrap();
    assert_eq!(stored.status.stats.len(), 4);
    assert_eq!(stored.status.phase, RestorePhase::Succeeded);
}

#[tokio::test]
async fn coordinator_runs_against_the_shared_directory() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::new(dir.path());
    store
        .put_repository(&Repository::new(NAMESPACE, REPOSITORY, "/mnt/backups/db"))
        .await
        .unwrap();
    store
        .put_restore_job(RestoreJob::new(
            NAMESPACE,
            JOB,
            RestoreTarget::new(TargetKind::Deployment, "web"),
            REPOSITORY,
        ))
        .await
        .unwrap();

    let events_path = dir.path().join(NAMESPACE).join("events.jsonl");
    let store = Arc::new(store);
    let coordinator = RestoreCoordinator::new(
        config("web-0"),
        store.clone(),
        store.clone(),
        Arc::new(ScriptedEngine::succeeding(2048)),
    )
    .events(Arc::new(FileEventSink::new(&events_path)));
    assert_ok!(coordinator.run().await);

    let job = store.get_restore_job(NAMESPACE, JOB).await.unwrap();
    assert_eq!(job.status.phase, RestorePhase::Succeeded);
    assert_eq!(job.status.stats[0].bytes_restored, Some(2048));

    let reasons = tokio::fs::read_to_string(&events_path)
        .await
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<RestoreEvent>(line).unwrap().reason)
        .collect::<Vec<_>>();
    assert_eq!(
        reasons,
        vec![EventReason::HostRestoreSucceeded, EventReason::RestoreSessionSucceeded]
    );

    let lock = store
        .get_lock(NAMESPACE, "restore-deployment-web")
        .await
        .unwrap()
        .unwrap();
    assert!(lock.record.is_released());
}
