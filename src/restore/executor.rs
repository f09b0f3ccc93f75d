use super::guard::IdempotencyGuard;
use crate::core::{HostRestoreStat, JobRef, RestoreError, RestoreTarget, Result};
use crate::lease::LeaseWatch;
use crate::state::RestoreStateClient;
use crate::transfer::{DataTransferEngine, RepositoryConnection, restore_options_for_host};
use std::sync::Arc;
use tracing::{Level, event};

/// Everything resolved about a restore before any lock is taken.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub job: JobRef,
    pub target: RestoreTarget,
    pub hostname: String,
    pub connection: RepositoryConnection,
}

/// What one executor run did.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The host was already processed or the job already resolved. Nothing ran.
    Skipped { hostname: String },
    /// The engine restored the host.
    Completed(HostRestoreStat),
    /// The engine failed. The failure has not been recorded yet.
    Failed { hostname: String, error: RestoreError },
}

impl ExecutionOutcome {
    pub fn hostname(&self) -> &str {
        match self {
            Self::Skipped { hostname } | Self::Failed { hostname, .. } => hostname,
            Self::Completed(stat) => &stat.hostname,
        }
    }
}

/// The unit of work run for a single host.
///
/// Calls the engine at most once per run and never retries it.
pub struct RestoreExecutor {
    state: Arc<dyn RestoreStateClient>,
    engine: Arc<dyn DataTransferEngine>,
}

impl RestoreExecutor {
    pub fn new(state: Arc<dyn RestoreStateClient>, engine: Arc<dyn DataTransferEngine>) -> Self {
        Self { state, engine }
    }

    /// Re-reads the job, so a contender that waited on the lock sees what the
    /// previous holder recorded.
    ///
    /// With a `lease`, the engine is only started while the lease is still
    /// held; otherwise the run fails with [`RestoreError::LockLost`] and
    /// nothing is recorded. A transfer already started is not interrupted.
    pub async fn run(
        &self,
        plan: &RestorePlan,
        lease: Option<&LeaseWatch>,
    ) -> Result<ExecutionOutcome> {
        let job = self
            .state
            .get_restore_job(&plan.job.namespace, &plan.job.name)
            .await?;

        if IdempotencyGuard::already_done(&job, &plan.hostname) {
            event!(
                Level::INFO,
                job = %plan.job,
                host = %plan.hostname,
                phase = %job.status.phase,
                "restore already processed for host, skipping"
            );
            return Ok(ExecutionOutcome::Skipped {
                hostname: plan.hostname.clone(),
            });
        }

        if lease.is_some_and(|watch| !watch.is_held()) {
            event!(
                Level::ERROR,
                job = %plan.job,
                host = %plan.hostname,
                "lease lost before the restore started, not restoring"
            );
            return Err(RestoreError::LockLost(format!(
                "lease lost before restoring host {} of {}",
                plan.hostname, plan.job
            )));
        }

        let options = restore_options_for_host(&plan.hostname, &job.spec.rules);
        event!(
            Level::INFO,
            job = %plan.job,
            host = %plan.hostname,
            source_host = %options.source_host,
            paths = options.restore_paths.len(),
            snapshots = options.snapshots.len(),
            "restoring host"
        );

        match self.engine.restore(&plan.connection, &options).await {
            Ok(output) => Ok(ExecutionOutcome::Completed(output.stat_for(&plan.hostname))),
            Err(error) => Ok(ExecutionOutcome::Failed {
                hostname: plan.hostname.clone(),
                error,
            }),
        }
    }
}
