// ============================================================================
// restoregate Library
// ============================================================================

pub mod config;
pub mod core;
pub mod events;
pub mod lease;
pub mod metrics;
pub mod restore;
pub mod state;
pub mod transfer;

// Re-export main types for convenience
pub use core::{
    HostRestorePhase, HostRestoreStat, JobRef, Repository, RestoreError, RestoreJob,
    RestorePhase, RestoreTarget, Result, TargetKind, TargetRef,
};

// Re-export configuration
pub use config::{
    CoordinatorConfig, ExecutionMode, LeaseTimings, SetupOptions, StatusRetryPolicy,
};

// Re-export the coordination API
pub use events::{EventReason, EventSink, EventType, RestoreEvent};
pub use lease::{DistributedMutex, LeaseGuard, LeaseStore, LeaseWatch, MutexConfig};
pub use metrics::{MetricsReporter, TextfileMetricsReporter};
pub use restore::{
    RestoreCoordinator, RestoreOutcome, RestoreReport, StatusSynchronizer, exit_code,
};
pub use state::{FileStateStore, InMemoryStateStore, RestoreStateClient};
pub use transfer::{CommandTransferEngine, DataTransferEngine, RestoreOutput};
