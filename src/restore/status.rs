use super::host::TopologyProvider;
use crate::config::StatusRetryPolicy;
use crate::core::{
    HostRestoreStat, JobRef, RestoreJob, RestoreJobStatus, RestorePhase, Result, format_duration,
};
use crate::events::{EventReason, EventSink, EventType, RestoreEvent, emit_best_effort};
use crate::metrics::{
    HostMetrics, LogMetricsReporter, MetricsReporter, SessionMetrics, report_host_best_effort,
    report_session_best_effort,
};
use crate::state::RestoreStateClient;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

/// Result of merging one host's outcome into a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The stat is durably part of the job status.
    Recorded(RestoreJob),
    /// The job was already terminal with a different outcome; nothing was written.
    LockedIn(RestoreJob),
}

impl StatusUpdate {
    pub fn job(&self) -> &RestoreJob {
        match self {
            Self::Recorded(job) | Self::LockedIn(job) => job,
        }
    }
}

/// The only writer of restore job status.
///
/// Each attempt re-reads the job, merges the stat, recomputes the phase and
/// writes it back with the read version; a concurrent write by another
/// contender makes the attempt conflict and the next one starts over.
pub struct StatusSynchronizer {
    state: Arc<dyn RestoreStateClient>,
    events: Arc<dyn EventSink>,
    topology: Arc<dyn TopologyProvider>,
    metrics: Arc<dyn MetricsReporter>,
    retry: StatusRetryPolicy,
}

impl StatusSynchronizer {
    pub fn new(
        state: Arc<dyn RestoreStateClient>,
        events: Arc<dyn EventSink>,
        topology: Arc<dyn TopologyProvider>,
        retry: StatusRetryPolicy,
    ) -> Self {
        Self {
            state,
            events,
            topology,
            metrics: Arc::new(LogMetricsReporter),
            retry,
        }
    }

    /// Set the metrics reporter (defaults to logging only)
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsReporter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn update(&self, job_ref: &JobRef, stat: HostRestoreStat) -> Result<StatusUpdate> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let job = self
                .state
                .get_restore_job(&job_ref.namespace, &job_ref.name)
                .await?;

            if job.status.phase.is_terminal() {
                if job.status.stat_for(&stat.hostname) == Some(&stat) {
                    return Ok(StatusUpdate::Recorded(job));
                }
                event!(
                    Level::WARN,
                    job = %job_ref,
                    host = %stat.hostname,
                    phase = %job.status.phase,
                    "restore job already resolved, discarding host outcome"
                );
                return Ok(StatusUpdate::LockedIn(job));
            }

            let expected = self.topology.expected_hosts(job.target()?).await?;
            let elapsed = job.age(Utc::now());
            let status = merge_status(&job.status, stat.clone(), expected, elapsed);
            if status == job.status {
                return Ok(StatusUpdate::Recorded(job));
            }

            let previous_phase = job.status.phase;
            let mut candidate = job;
            candidate.status = status;
            match self.state.update_restore_job_status(&candidate).await {
                Ok(updated) => {
                    event!(
                        Level::INFO,
                        job = %job_ref,
                        host = %stat.hostname,
                        phase = %updated.status.phase,
                        attempt,
                        "recorded host restore outcome"
                    );
                    self.emit_events(job_ref, &stat, previous_phase, updated.status.phase)
                        .await;
                    self.report_metrics(job_ref, &stat, previous_phase, &updated.status, elapsed)
                        .await;
                    return Ok(StatusUpdate::Recorded(updated));
                }
                Err(err) if err.is_conflict() && attempt < max_attempts => {
                    let backoff = self.retry.backoff_ms(attempt);
                    log::warn!(
                        "Status update conflict for {} (attempt {}/{}), retrying in {}ms: {}",
                        job_ref,
                        attempt,
                        max_attempts,
                        backoff,
                        err
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn report_metrics(
        &self,
        job_ref: &JobRef,
        stat: &HostRestoreStat,
        previous: RestorePhase,
        status: &RestoreJobStatus,
        elapsed: Duration,
    ) {
        report_host_best_effort(self.metrics.as_ref(), HostMetrics::from_stat(job_ref, stat)).await;
        if status.phase.is_terminal() && previous != status.phase {
            report_session_best_effort(
                self.metrics.as_ref(),
                SessionMetrics::from_status(job_ref, status, elapsed),
            )
            .await;
        }
    }

    async fn emit_events(
        &self,
        job_ref: &JobRef,
        stat: &HostRestoreStat,
        previous: RestorePhase,
        current: RestorePhase,
    ) {
        if !stat.is_failed() {
            emit_best_effort(
                self.events.as_ref(),
                RestoreEvent::new(
                    job_ref,
                    EventType::Normal,
                    EventReason::HostRestoreSucceeded,
                    format!("Successfully restored host \"{}\"", stat.hostname),
                ),
            )
            .await;
        }
        if previous == current {
            return;
        }
        let session = match current {
            RestorePhase::Succeeded => Some((
                EventType::Normal,
                EventReason::RestoreSessionSucceeded,
                "Restore session completed successfully".to_string(),
            )),
            RestorePhase::Failed => Some((
                EventType::Warning,
                EventReason::RestoreSessionFailed,
                format!("Restore session failed on host \"{}\"", stat.hostname),
            )),
            RestorePhase::Pending | RestorePhase::Running => None,
        };
        if let Some((event_type, reason, message)) = session {
            emit_best_effort(
                self.events.as_ref(),
                RestoreEvent::new(job_ref, event_type, reason, message),
            )
            .await;
        }
    }
}

/// Merges `stat` and recomputes the phase for `expected` hosts.
///
/// One failed host fails the job. The job succeeds once every expected host
/// has a stat and none failed. Otherwise the phase is kept. A status that
/// turns terminal gets `session_elapsed` as its session duration.
pub fn merge_status(
    current: &RestoreJobStatus,
    stat: HostRestoreStat,
    expected: u32,
    session_elapsed: Duration,
) -> RestoreJobStatus {
    let mut status = current.clone();
    let failed = stat.is_failed();
    status.upsert_stat(stat);
    status.total_hosts = Some(expected);
    status.phase = if failed {
        RestorePhase::Failed
    } else if status.stats.len() as u64 >= u64::from(expected)
        && status.stats.iter().all(|s| !s.is_failed())
    {
        RestorePhase::Succeeded
    } else {
        current.phase
    };
    if status.phase.is_terminal() {
        status.session_duration = Some(format_duration(session_elapsed));
    }
    status
}
