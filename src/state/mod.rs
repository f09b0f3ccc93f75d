//! Access to the shared, externally persisted restore state.
//!
//! Every store here also implements [`crate::lease::LeaseStore`], so a single
//! backend can hold both the restore job records and the lock records that
//! serialize access to them.

use crate::core::{Repository, RestoreJob, Result};
use async_trait::async_trait;

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;

/// Read/write access to restore jobs and repositories.
#[async_trait]
pub trait RestoreStateClient: Send + Sync {
    /// Fetches the current version of a restore job.
    async fn get_restore_job(&self, namespace: &str, name: &str) -> Result<RestoreJob>;

    /// Fetches the repository a restore job reads from.
    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository>;

    /// Replaces the status of `job`.
    ///
    /// Fails with [`crate::RestoreError::Conflict`] when `job.resource_version`
    /// no longer matches the stored version. On success the returned job carries
    /// the new version.
    async fn update_restore_job_status(&self, job: &RestoreJob) -> Result<RestoreJob>;
}
