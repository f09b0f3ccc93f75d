use super::RestoreStateClient;
use crate::core::{LockRecord, Repository, RestoreError, RestoreJob, Result, VersionedLock};
use crate::lease::LeaseStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, OpenOptions};
use tokio::time::{Instant, sleep};
use uuid::Uuid;

const RESTORE_JOBS_DIR: &str = "restorejobs";
const REPOSITORIES_DIR: &str = "repositories";
const LEASES_DIR: &str = "leases";

/// A guard file older than this is assumed to belong to a crashed writer.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(5);
const GUARD_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State and lease store backed by JSON documents in a shared directory.
///
/// Layout: `<root>/<namespace>/{restorejobs,repositories,leases}/<name>.json`.
/// Documents are replaced atomically by rename. Compare-and-swap sections are
/// serialized across processes with a create-exclusive `<name>.json.guard` file.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, namespace: &str, kind: &str, name: &str) -> Result<PathBuf> {
        for (label, value) in [("namespace", namespace), ("name", name)] {
            if value.is_empty() || value.contains(['/', '\\']) || value.starts_with('.') {
                return Err(RestoreError::Config(format!(
                    "invalid {label} '{value}' for file state store"
                )));
            }
        }
        Ok(self
            .root
            .join(namespace)
            .join(kind)
            .join(format!("{name}.json")))
    }

    /// Stores a restore job, overwriting any existing one, and returns the stored version.
    pub async fn put_restore_job(&self, mut job: RestoreJob) -> Result<RestoreJob> {
        let path = self.document_path(&job.namespace, RESTORE_JOBS_DIR, &job.name)?;
        let guard = WriteGuard::acquire(&path).await?;
        let previous = read_document::<RestoreJob>(&path)
            .await?
            .map(|existing| existing.resource_version)
            .unwrap_or_default();
        job.resource_version = previous + 1;
        job.creation_timestamp.get_or_insert_with(Utc::now);
        let result = write_document(&path, &job).await;
        guard.release().await;
        result.map(|_| job)
    }

    pub async fn put_repository(&self, repository: &Repository) -> Result<()> {
        let path = self.document_path(&repository.namespace, REPOSITORIES_DIR, &repository.name)?;
        write_document(&path, repository).await
    }
}

#[async_trait]
impl RestoreStateClient for FileStateStore {
    async fn get_restore_job(&self, namespace: &str, name: &str) -> Result<RestoreJob> {
        let path = self.document_path(namespace, RESTORE_JOBS_DIR, name)?;
        read_document(&path)
            .await?
            .ok_or_else(|| RestoreError::NotFound(format!("RestoreJob {namespace}/{name}")))
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository> {
        let path = self.document_path(namespace, REPOSITORIES_DIR, name)?;
        read_document(&path)
            .await?
            .ok_or_else(|| RestoreError::NotFound(format!("Repository {namespace}/{name}")))
    }

    async fn update_restore_job_status(&self, job: &RestoreJob) -> Result<RestoreJob> {
        let path = self.document_path(&job.namespace, RESTORE_JOBS_DIR, &job.name)?;
        let guard = WriteGuard::acquire(&path).await?;
        let result = async {
            let mut stored = read_document::<RestoreJob>(&path)
                .await?
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
            write_document(&path, &stored).await?;
            Ok(stored)
        }
        .await;
        guard.release().await;
        result
    }
}

#[async_trait]
impl LeaseStore for FileStateStore {
    async fn get_lock(&self, namespace: &str, key: &str) -> Result<Option<VersionedLock>> {
        let path = self.document_path(namespace, LEASES_DIR, key)?;
        read_document(&path).await
    }

    async fn create_lock(
        &self,
        namespace: &str,
        key: &str,
        record: LockRecord,
    ) -> Result<VersionedLock> {
        let path = self.document_path(namespace, LEASES_DIR, key)?;
        let guard = WriteGuard::acquire(&path).await?;
        let result = async {
            if read_document::<VersionedLock>(&path).await?.is_some() {
                return Err(RestoreError::Conflict(format!(
                    "lock {namespace}/{key} already exists"
                )));
            }
            let lock = VersionedLock {
                resource_version: 1,
                record,
            };
            write_document(&path, &lock).await?;
            Ok(lock)
        }
        .await;
        guard.release().await;
        result
    }

    async fn update_lock(
        &self,
        namespace: &str,
        key: &str,
        lock: &VersionedLock,
    ) -> Result<VersionedLock> {
        let path = self.document_path(namespace, LEASES_DIR, key)?;
        let guard = WriteGuard::acquire(&path).await?;
        let result = async {
            let stored = read_document::<VersionedLock>(&path)
                .await?
                .ok_or_else(|| RestoreError::NotFound(format!("lock {namespace}/{key}")))?;
            if stored.resource_version != lock.resource_version {
                return Err(RestoreError::Conflict(format!(
                    "lock {namespace}/{key} has version {}, update was based on {}",
                    stored.resource_version, lock.resource_version
                )));
            }
            let next = VersionedLock {
                resource_version: stored.resource_version + 1,
                record: lock.record.clone(),
            };
            write_document(&path, &next).await?;
            Ok(next)
        }
        .await;
        guard.release().await;
        result
    }
}

async fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RestoreError::Backend(format!(
            "Failed to read '{}': {}",
            path.display(),
            err
        ))),
    }
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &bytes).await
}

pub(crate) async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(|err| {
            RestoreError::Backend(format!(
                "Failed to create parent directory '{}': {}",
                parent.display(),
                err
            ))
        })?;
    }

    let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp, bytes).await.map_err(|err| {
        RestoreError::Backend(format!(
            "Failed to write temp file '{}': {}",
            tmp.display(),
            err
        ))
    })?;

    fs::rename(&tmp, path).await.map_err(|err| {
        RestoreError::Backend(format!(
            "Failed to rename temp file '{}' -> '{}': {}",
            tmp.display(),
            path.display(),
            err
        ))
    })?;
    Ok(())
}

/// Cross-process critical section around one document.
struct WriteGuard {
    path: Option<PathBuf>,
}

impl WriteGuard {
    async fn acquire(document: &Path) -> Result<Self> {
        let mut guard_name = document.as_os_str().to_owned();
        guard_name.push(".guard");
        let path = PathBuf::from(guard_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|err| {
                RestoreError::Backend(format!(
                    "Failed to create parent directory '{}': {}",
                    parent.display(),
                    err
                ))
            })?;
        }

        let deadline = Instant::now() + GUARD_WAIT_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => return Ok(Self { path: Some(path) }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if break_stale_guard(&path).await {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(RestoreError::Backend(format!(
                            "Timed out waiting for write guard '{}'",
                            path.display()
                        )));
                    }
                    sleep(GUARD_POLL_INTERVAL).await;
                }
                Err(err) => {
                    return Err(RestoreError::Backend(format!(
                        "Failed to create write guard '{}': {}",
                        path.display(),
                        err
                    )));
                }
            }
        }
    }

    async fn release(mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = fs::remove_file(&path).await {
                log::warn!("Failed to remove write guard '{}': {}", path.display(), err);
            }
        }
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Removes `guard` if it is stale, returning whether it did.
///
/// The staleness check and the removal run under a create-exclusive
/// `.break` file, so a waiter that judged an old guard stale cannot remove
/// the fresh guard another waiter created after breaking it.
async fn break_stale_guard(guard: &Path) -> bool {
    if !guard_is_stale(guard).await {
        return false;
    }
    let mut breaker_name = guard.as_os_str().to_owned();
    breaker_name.push(".break");
    let breaker = PathBuf::from(breaker_name);

    match OpenOptions::new().write(true).create_new(true).open(&breaker).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            if guard_is_stale(&breaker).await {
                log::warn!("Removing stale guard breaker '{}'", breaker.display());
                let _ = fs::remove_file(&breaker).await;
            }
            return false;
        }
        Err(_) => return false,
    }

    let broken = guard_is_stale(guard).await;
    if broken {
        log::warn!("Removing stale write guard '{}'", guard.display());
        let _ = fs::remove_file(guard).await;
    }
    let _ = fs::remove_file(&breaker).await;
    broken
}

async fn guard_is_stale(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > GUARD_STALE_AFTER)
}
