use super::executor::{ExecutionOutcome, RestoreExecutor, RestorePlan};
use super::failure::FailureHandler;
use super::host::{TargetReplicaTopology, TopologyProvider, hostname_for};
use super::status::{StatusSynchronizer, StatusUpdate};
use crate::config::{CoordinatorConfig, ExecutionMode};
use crate::core::{HostRestoreStat, JobRef, RestoreError, RestorePhase, Result};
use crate::events::{EventSink, LogEventSink};
use crate::lease::{DistributedMutex, LeaseStore, LeaseWatch, MutexConfig, restore_lock_key};
use crate::metrics::{LogMetricsReporter, MetricsReporter};
use crate::state::RestoreStateClient;
use crate::transfer::{DataTransferEngine, RepositoryConnection};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// What a finished run did for this contender's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Already processed by an earlier run or another contender.
    Skipped,
    /// Restored and recorded. `phase` is the job phase after the write.
    Recorded {
        stat: HostRestoreStat,
        phase: RestorePhase,
    },
    /// Restored, but the job had already been resolved so the stat was dropped.
    Discarded {
        stat: HostRestoreStat,
        phase: RestorePhase,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub hostname: String,
    pub outcome: RestoreOutcome,
}

/// Process exit code for a finished run: zero for any report, non-zero for
/// any error so a supervisor restarts the contender.
pub fn exit_code(result: &Result<RestoreReport>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

/// Drives one contender through resolve, lock, restore, record and release.
pub struct RestoreCoordinator {
    config: CoordinatorConfig,
    state: Arc<dyn RestoreStateClient>,
    leases: Arc<dyn LeaseStore>,
    engine: Arc<dyn DataTransferEngine>,
    events: Arc<dyn EventSink>,
    topology: Arc<dyn TopologyProvider>,
    metrics: Arc<dyn MetricsReporter>,
}

impl RestoreCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        state: Arc<dyn RestoreStateClient>,
        leases: Arc<dyn LeaseStore>,
        engine: Arc<dyn DataTransferEngine>,
    ) -> Self {
        Self {
            config,
            state,
            leases,
            engine,
            events: Arc::new(LogEventSink),
            topology: Arc::new(TargetReplicaTopology),
            metrics: Arc::new(LogMetricsReporter),
        }
    }

    /// Set the event sink (defaults to logging only)
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the source of the expected host count
    pub fn topology(mut self, topology: Arc<dyn TopologyProvider>) -> Self {
        self.topology = topology;
        self
    }

    /// Set the metrics reporter (defaults to logging only)
    pub fn metrics(mut self, metrics: Arc<dyn MetricsReporter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Runs this contender to completion.
    ///
    /// Configuration problems are reported before the lock is touched. A
    /// host failure is durably recorded before the error is returned.
    pub async fn run(&self) -> Result<RestoreReport> {
        self.config.validate()?;
        let plan = self.prepare().await?;
        let span = info_span!(
            "restore.run",
            job = %plan.job,
            host = %plan.hostname,
            mode = %self.config.mode
        );
        async {
            match self.config.mode {
                ExecutionMode::Exclusive => self.run_exclusive(&plan).await,
                ExecutionMode::NonExclusive => self.execute(&plan, None).await,
            }
        }
        .instrument(span)
        .await
    }

    /// Resolves everything that can fail on configuration alone.
    pub async fn prepare(&self) -> Result<RestorePlan> {
        let job = self
            .state
            .get_restore_job(&self.config.namespace, &self.config.restore_job)
            .await?;
        let target = job.target()?.clone();
        let repository_name = job.spec.repository.name.trim();
        if repository_name.is_empty() {
            return Err(RestoreError::Config(format!(
                "invalid RestoreJob {}. Repository name is empty",
                job.key()
            )));
        }
        let repository = self
            .state
            .get_repository(&job.namespace, repository_name)
            .await?;
        let hostname = hostname_for(&target, &self.config.pod_name)?;
        let connection =
            RepositoryConnection::for_repository(&repository, &hostname, &self.config.setup)?;
        Ok(RestorePlan {
            job: JobRef::new(job.namespace, job.name),
            target,
            hostname,
            connection,
        })
    }

    async fn run_exclusive(&self, plan: &RestorePlan) -> Result<RestoreReport> {
        let lock_key = restore_lock_key(&plan.target.reference);
        let mutex = DistributedMutex::new(
            self.leases.clone(),
            MutexConfig::new(
                self.config.namespace.clone(),
                lock_key.clone(),
                self.config.pod_name.clone(),
                self.config.lease,
            ),
        )?;

        let guard = mutex.acquire().await?;
        let watch = guard.watch();
        let result = self.execute(plan, Some(&watch)).await;
        let held = guard.is_held();
        let released = guard.release().await;

        match result {
            Err(err) => match released {
                Ok(()) => Err(err),
                Err(release_err) => Err(RestoreError::aggregate(vec![err, release_err])),
            },
            Ok(_) if !held => {
                if let Err(release_err) = released {
                    log::warn!(
                        "Failed to step down from lost lease {}: {}",
                        lock_key,
                        release_err
                    );
                }
                Err(RestoreError::LockLost(format!(
                    "lease {} was lost while restoring host {}; the outcome was recorded",
                    lock_key, plan.hostname
                )))
            }
            Ok(report) => {
                if let Err(release_err) = released {
                    log::warn!(
                        "Failed to step down from lease {}, it will expire on its own: {}",
                        lock_key,
                        release_err
                    );
                }
                Ok(report)
            }
        }
    }

    async fn execute(&self, plan: &RestorePlan, lease: Option<&LeaseWatch>) -> Result<RestoreReport> {
        let synchronizer = Arc::new(StatusSynchronizer::new(
            self.state.clone(),
            self.events.clone(),
            self.topology.clone(),
            self.config.status_retry,
        )
        .with_metrics(self.metrics.clone()));
        let failures = FailureHandler::new(synchronizer.clone(), self.events.clone());
        let executor = RestoreExecutor::new(self.state.clone(), self.engine.clone());

        let outcome = match executor.run(plan, lease).await {
            Ok(outcome) => outcome,
            Err(err @ RestoreError::LockLost(_)) => return Err(err),
            Err(err) => return Err(failures.handle(&plan.job, &plan.hostname, err).await),
        };

        match outcome {
            ExecutionOutcome::Skipped { hostname } => Ok(RestoreReport {
                hostname,
                outcome: RestoreOutcome::Skipped,
            }),
            ExecutionOutcome::Failed { hostname, error } => {
                Err(failures.handle(&plan.job, &hostname, error).await)
            }
            ExecutionOutcome::Completed(stat) => {
                let hostname = stat.hostname.clone();
                match synchronizer.update(&plan.job, stat.clone()).await {
                    Ok(StatusUpdate::Recorded(job)) => {
                        event!(
                            Level::INFO,
                            job = %plan.job,
                            host = %hostname,
                            phase = %job.status.phase,
                            "host restore completed"
                        );
                        Ok(RestoreReport {
                            hostname,
                            outcome: RestoreOutcome::Recorded {
                                stat,
                                phase: job.status.phase,
                            },
                        })
                    }
                    Ok(StatusUpdate::LockedIn(job)) => Ok(RestoreReport {
                        hostname,
                        outcome: RestoreOutcome::Discarded {
                            stat,
                            phase: job.status.phase,
                        },
                    }),
                    Err(err) => Err(failures.handle(&plan.job, &hostname, err).await),
                }
            }
        }
    }
}
