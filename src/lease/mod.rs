//! Lease-based distributed mutex.
//!
//! The mutex is a turn-taking primitive: contenders for the same lock key take
//! the lease one at a time, do their unit of work, and step down explicitly so
//! the next contender does not have to wait for the lease to expire.

use crate::core::{LockRecord, Result, TargetRef, VersionedLock};
use async_trait::async_trait;

pub mod mutex;

pub use mutex::{DistributedMutex, LeaseGuard, LeaseWatch, MutexConfig};

/// Backing store for lock records.
///
/// Implementations must provide compare-and-swap semantics: `create_lock` fails
/// with [`crate::RestoreError::Conflict`] if the record already exists, and
/// `update_lock` fails the same way if the stored version differs from
/// `lock.resource_version`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get_lock(&self, namespace: &str, key: &str) -> Result<Option<VersionedLock>>;

    async fn create_lock(
        &self,
        namespace: &str,
        key: &str,
        record: LockRecord,
    ) -> Result<VersionedLock>;

    async fn update_lock(
        &self,
        namespace: &str,
        key: &str,
        lock: &VersionedLock,
    ) -> Result<VersionedLock>;
}

/// Lock key shared by all replicas of one workload.
pub fn restore_lock_key(target: &TargetRef) -> String {
    format!(
        "restore-{}-{}",
        target.kind.as_str().to_ascii_lowercase(),
        target.name
    )
}
