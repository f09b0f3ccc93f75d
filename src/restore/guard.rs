use crate::core::RestoreJob;

/// Decides from recorded state whether a host's restore must not run again.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyGuard;

impl IdempotencyGuard {
    /// True once the job reached a terminal phase, or once any stat exists for
    /// `hostname`, whatever its outcome.
    pub fn already_done(job: &RestoreJob, hostname: &str) -> bool {
        job.status.phase.is_terminal() || job.status.stat_for(hostname).is_some()
    }
}
