pub mod error;
pub mod types;

pub use error::{RestoreError, Result};
pub use types::{
    HostRestorePhase, HostRestoreStat, JobRef, LockRecord, Repository, RepositoryBackend, RepositoryRef,
    RestoreJob, RestoreJobSpec, RestoreJobStatus, RestorePhase, RestoreRule, RestoreTarget, TargetKind,
    TargetRef, VersionedLock, format_duration,
};
