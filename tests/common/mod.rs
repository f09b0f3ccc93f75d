#![allow(dead_code)]

use async_trait::async_trait;
use restoregate::config::LeaseTimings;
use restoregate::core::{LockRecord, VersionedLock};
use restoregate::transfer::{HostRestoreOptions, RepositoryConnection};
use restoregate::{
    CoordinatorConfig, DataTransferEngine, HostRestoreStat, InMemoryStateStore, LeaseStore,
    Repository, RestoreError, RestoreJob, RestoreOutput, RestoreStateClient, RestoreTarget, Result,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

pub const NAMESPACE: &str = "demo";
pub const JOB: &str = "restore-db";
pub const REPOSITORY: &str = "gcs-repo";

/// Short timings so contenders rotate quickly in tests.
pub fn fast_timings() -> LeaseTimings {
    LeaseTimings::new(
        Duration::from_millis(600),
        Duration::from_millis(400),
        Duration::from_millis(50),
    )
}

pub fn config(pod_name: &str) -> CoordinatorConfig {
    CoordinatorConfig::new(NAMESPACE, JOB, pod_name).lease(fast_timings())
}

pub async fn seed(store: &InMemoryStateStore, target: RestoreTarget) -> RestoreJob {
    store
        .put_repository(Repository::new(NAMESPACE, REPOSITORY, "gs:backups/db"))
        .await;
    store
        .put_restore_job(RestoreJob::new(NAMESPACE, JOB, target, REPOSITORY))
        .await
}

/// Transfer engine double that records calls and how many ran at once.
#[derive(Default)]
pub struct ScriptedEngine {
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub delay: Duration,
    pub failure: Option<String>,
    pub bytes_restored: u64,
    pub hosts: Mutex<Vec<String>>,
    /// Set while the engine runs, to make the lease store fail at that point.
    pub on_start: Option<Arc<AtomicBool>>,
}

impl ScriptedEngine {
    pub fn succeeding(bytes_restored: u64) -> Self {
        Self {
            bytes_restored,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataTransferEngine for ScriptedEngine {
    async fn restore(
        &self,
        _connection: &RepositoryConnection,
        options: &HostRestoreOptions,
    ) -> Result<RestoreOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.hosts.lock().await.push(options.host.clone());
        if let Some(flag) = &self.on_start {
            flag.store(true, Ordering::SeqCst);
        }

        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.failure {
            Some(message) => Err(RestoreError::Transfer(message.clone())),
            None => Ok(RestoreOutput {
                host_stats: vec![
                    HostRestoreStat::succeeded(&options.host)
                        .with_bytes_restored(self.bytes_restored)
                        .with_duration(self.delay),
                ],
                duration: self.delay,
            }),
        }
    }
}

/// Lease store whose renewals fail once `broken` is set, and which rejects
/// every call once `unreachable` is set.
pub struct BreakableLeaseStore {
    pub inner: InMemoryStateStore,
    pub broken: Arc<AtomicBool>,
    pub unreachable: Arc<AtomicBool>,
}

impl BreakableLeaseStore {
    pub fn new(inner: InMemoryStateStore) -> Self {
        Self {
            inner,
            broken: Arc::new(AtomicBool::new(false)),
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RestoreError::Backend("lease api unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for BreakableLeaseStore {
    async fn get_lock(&self, namespace: &str, key: &str) -> Result<Option<VersionedLock>> {
        self.check_reachable()?;
        self.inner.get_lock(namespace, key).await
    }

    async fn create_lock(
        &self,
        namespace: &str,
        key: &str,
        record: LockRecord,
    ) -> Result<VersionedLock> {
        self.check_reachable()?;
        self.inner.create_lock(namespace, key, record).await
    }

    async fn update_lock(
        &self,
        namespace: &str,
        key: &str,
        lock: &VersionedLock,
    ) -> Result<VersionedLock> {
        self.check_reachable()?;
        if self.broken.load(Ordering::SeqCst) {
            return Err(RestoreError::Backend("lease api unreachable".to_string()));
        }
        self.inner.update_lock(namespace, key, lock).await
    }
}

/// State client that stalls on one `get_restore_job` call.
///
/// The stalled call is the `stall_on`-th read (1-based). `on_stall` is set
/// before it sleeps for `stall`.
pub struct StallingStateClient {
    pub inner: InMemoryStateStore,
    pub reads: AtomicUsize,
    pub stall_on: usize,
    pub stall: Duration,
    pub on_stall: Arc<AtomicBool>,
}

impl StallingStateClient {
    pub fn new(inner: InMemoryStateStore, stall_on: usize, stall: Duration) -> Self {
        Self {
            inner,
            reads: AtomicUsize::new(0),
            stall_on,
            stall,
            on_stall: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl RestoreStateClient for StallingStateClient {
    async fn get_restore_job(&self, namespace: &str, name: &str) -> Result<RestoreJob> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if read == self.stall_on {
            self.on_stall.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.stall).await;
        }
        self.inner.get_restore_job(namespace, name).await
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository> {
        self.inner.get_repository(namespace, name).await
    }

    async fn update_restore_job_status(&self, job: &RestoreJob) -> Result<RestoreJob> {
        self.inner.update_restore_job_status(job).await
    }
}
