use super::status::{StatusSynchronizer, StatusUpdate};
use crate::core::{HostRestoreStat, JobRef, RestoreError};
use crate::events::{EventReason, EventSink, EventType, RestoreEvent, emit_best_effort};
use std::sync::Arc;
use tracing::{Level, event};

/// Turns an unrecoverable host failure into durable state.
///
/// The returned error is what the process terminates with. Stepping down and
/// exiting are left to the caller, after this returns.
pub struct FailureHandler {
    synchronizer: Arc<StatusSynchronizer>,
    events: Arc<dyn EventSink>,
}

impl FailureHandler {
    pub fn new(synchronizer: Arc<StatusSynchronizer>, events: Arc<dyn EventSink>) -> Self {
        Self {
            synchronizer,
            events,
        }
    }

    pub async fn handle(&self, job: &JobRef, hostname: &str, err: RestoreError) -> RestoreError {
        event!(
            Level::ERROR,
            job = %job,
            host = %hostname,
            error = %err,
            "restore failed"
        );

        let stat = HostRestoreStat::failed(hostname, err.detail());
        let recorded = self.synchronizer.update(job, stat).await;

        emit_best_effort(
            self.events.as_ref(),
            RestoreEvent::new(
                job,
                EventType::Warning,
                EventReason::HostRestoreFailed,
                format!("Failed to restore for host \"{}\". Reason: {}", hostname, err.detail()),
            ),
        )
        .await;

        match recorded {
            Ok(StatusUpdate::Recorded(_)) => err,
            Ok(StatusUpdate::LockedIn(current)) => {
                log::warn!(
                    "RestoreJob {} was already {} when host {} failed; failure not recorded",
                    job,
                    current.status.phase,
                    hostname
                );
                err
            }
            Err(record_err) => {
                log::error!(
                    "Failed to record restore failure for host {} of {}: {}",
                    hostname,
                    job,
                    record_err
                );
                RestoreError::aggregate(vec![err, record_err])
            }
        }
    }
}
