use super::RestoreStateClient;
use crate::core::{LockRecord, Repository, RestoreError, RestoreJob, Result, VersionedLock};
use crate::lease::LeaseStore;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

type ObjectKey = (String, String);

#[derive(Default)]
struct InMemoryState {
    restore_jobs: HashMap<ObjectKey, RestoreJob>,
    repositories: HashMap<ObjectKey, Repository>,
    locks: HashMap<ObjectKey, VersionedLock>,
    status_writes: u64,
}

/// An in-memory state and lease store.
///
/// Cloning shares the underlying state, so several contenders in one process
/// observe the same records, the way separate pods observe one API server.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a restore job, overwriting any existing one, and returns the stored version.
    pub async fn put_restore_job(&self, mut job: RestoreJob) -> RestoreJob {
        let mut state = self.state.lock().await;
        let key = (job.namespace.clone(), job.name.clone());
        let previous = state
            .restore_jobs
            .get(&key)
            .map(|existing| existing.resource_version)
            .unwrap_or_default();
        job.resource_version = previous + 1;
        job.creation_timestamp.get_or_insert_with(Utc::now);
        state.restore_jobs.insert(key, job.clone());
        job
    }

    pub async fn put_repository(&self, repository: Repository) {
        let mut state = self.state.lock().await;
        state.repositories.insert(
            (repository.namespace.clone(), repository.name.clone()),
            repository,
        );
    }

    /// Number of successful status writes, across all jobs.
    pub async fn status_writes(&self) -> u64 {
        self.state.lock().await.status_writes
    }
}

#[async_trait]
impl RestoreStateClient for InMemoryStateStore {
    async fn get_restore_job(&self, namespace: &str, name: &str) -> Result<RestoreJob> {
        let state = self.state.lock().await;
        state
            .restore_jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RestoreError::NotFound(format!("RestoreJob {namespace}/{name}")))
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository> {
        let state = self.state.lock().await;
        state
            .repositories
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| RestoreError::NotFound(format!("Repository {namespace}/{name}")))
    }

    async fn update_restore_job_status(&self, job: &RestoreJob) -> Result<RestoreJob> {
        let mut state = self.state.lock().await;
        let key = (job.namespace.clone(), job.name.clone());
        let stored = state
            .restore_jobs
            .get_mut(&key)
            .ok_or_else(|| RestoreError::NotFound(format!("RestoreJob {}", job.key())))?;
        if stored.resource_version != job.resource_version {
            return Err(RestoreError::Conflict(format!(
                "RestoreJob {} has version {}, update was based on {}",
                job.key(),
                stored.resource_version,
                job.resource_version
            )));
        }
        stored.status = job.status.clone();
        stored.resource_version += 1;
        let updated = stored.clone();
        state.status_writes += 1;
        Ok(updated)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStateStore {
    async fn get_lock(&self, namespace: &str, key: &str) -> Result<Option<VersionedLock>> {
        let state = self.state.lock().await;
        Ok(state
            .locks
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn create_lock(
        &self,
        namespace: &str,
        key: &str,
        record: LockRecord,
    ) -> Result<VersionedLock> {
        let mut state = self.state.lock().await;
        let object_key = (namespace.to_string(), key.to_string());
        if state.locks.contains_key(&object_key) {
            return Err(RestoreError::Conflict(format!(
                "lock {namespace}/{key} already exists"
            )));
        }
        let lock = VersionedLock {
            resource_version: 1,
            record,
        };
        state.locks.insert(object_key, lock.clone());
        Ok(lock)
    }

    async fn update_lock(
        &self,
        namespace: &str,
        key: &str,
        lock: &VersionedLock,
    ) -> Result<VersionedLock> {
        let mut state = self.state.lock().await;
        let stored = state
            .locks
            .get_mut(&(namespace.to_string(), key.to_string()))
            .ok_or_else(|| RestoreError::NotFound(format!("lock {namespace}/{key}")))?;
        if stored.resource_version != lock.resource_version {
            return Err(RestoreError::Conflict(format!(
                "lock {namespace}/{key} has version {}, update was based on {}",
                stored.resource_version, lock.resource_version
            )));
        }
        stored.record = lock.record.clone();
        stored.resource_version += 1;
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HostRestoreStat, RestoreTarget, TargetKind};
    use chrono::Utc;

    fn job() -> RestoreJob {
        RestoreJob::new(
            "demo",
            "restore",
            RestoreTarget::new(TargetKind::Deployment, "web"),
            "repo",
        )
    }

    #[tokio::test]
    async fn stale_status_update_conflicts() {
        let store = InMemoryStateStore::new();
        let stored = store.put_restore_job(job()).await;

        let mut first = stored.clone();
        first.status.upsert_stat(HostRestoreStat::succeeded("host-0"));
        let updated = store.update_restore_job_status(&first).await.unwrap();
        assert_eq!(updated.resource_version, stored.resource_version + 1);

        let err = store.update_restore_job_status(&stored).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.status_writes().await, 1);
    }

    #[tokio::test]
    async fn lock_create_is_exclusive_and_update_is_versioned() {
        let store = InMemoryStateStore::new();
        let now = Utc::now();
        let record = LockRecord {
            holder_identity: "pod-0".to_string(),
            lease_duration_ms: 15_000,
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        };
        let created = store.create_lock("demo", "k", record.clone()).await.unwrap();
        assert!(store.create_lock("demo", "k", record).await.unwrap_err().is_conflict());

        let renewed = store.update_lock("demo", "k", &created).await.unwrap();
        assert_eq!(renewed.resource_version, 2);
        assert!(store.update_lock("demo", "k", &created).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let store = InMemoryStateStore::new();
        assert!(matches!(
            store.get_restore_job("demo", "nope").await,
            Err(RestoreError::NotFound(_))
        ));
        assert!(store.get_lock("demo", "nope").await.unwrap().is_none());
    }
}
