use crate::core::{RestoreError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod setup;

pub use setup::{IoNiceSettings, NiceSettings, SetupOptions};

/// Environment variable holding the invoking pod's name.
pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_NAMESPACE: &str = "NAMESPACE";
pub const ENV_RESTORE_SESSION: &str = "RESTORE_SESSION";
pub const ENV_RESTORE_MODEL: &str = "RESTORE_MODEL";

/// How repository access is serialized between replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Every replica restores from a repository that only one writer may lock at a
    /// time, so attempts are serialized through the distributed mutex.
    #[default]
    Exclusive,
    /// The execution substrate (one job per host) already guarantees a single writer.
    NonExclusive,
}

impl ExecutionMode {
    pub fn requires_mutex(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Exclusive => "init-container",
            Self::NonExclusive => "job",
        };
        write!(f, "{label}")
    }
}

impl FromStr for ExecutionMode {
    type Err = RestoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "init-container" | "exclusive" => Ok(Self::Exclusive),
            "job" | "non-exclusive" => Ok(Self::NonExclusive),
            other => Err(RestoreError::Config(format!(
                "unknown restore model '{}', expected 'init-container' or 'job'",
                other
            ))),
        }
    }
}

/// Tolerated ratio between renew deadline and retry period.
pub const LEASE_JITTER_FACTOR: f64 = 1.2;

/// Lease tuning for the distributed mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimings {
    /// How long a non-renewed lease stays valid for other contenders.
    pub lease_duration: Duration,
    /// How long the holder keeps retrying renewal before it gives up the lease.
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts.
    pub retry_period: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseTimings {
    pub fn new(lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Self {
        Self {
            lease_duration,
            renew_deadline,
            retry_period,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() || self.renew_deadline.is_zero() || self.retry_period.is_zero()
        {
            return Err(RestoreError::Config(
                "lease duration, renew deadline and retry period must be positive".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(RestoreError::Config(format!(
                "lease duration ({:?}) must be greater than renew deadline ({:?})",
                self.lease_duration, self.renew_deadline
            )));
        }
        if self.renew_deadline.as_secs_f64() <= self.retry_period.as_secs_f64() * LEASE_JITTER_FACTOR
        {
            return Err(RestoreError::Config(format!(
                "renew deadline ({:?}) must be greater than retry period ({:?}) * {}",
                self.renew_deadline, self.retry_period, LEASE_JITTER_FACTOR
            )));
        }
        Ok(())
    }
}

/// Retry policy for optimistic status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRetryPolicy {
    /// Maximum number of read-modify-write attempts.
    pub max_attempts: usize,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for StatusRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

impl StatusRetryPolicy {
    /// Computes exponential retry backoff in milliseconds.
    pub fn backoff_ms(&self, attempt: usize) -> u64 {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        backoff
    }
}

/// Configuration of one restore contender.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Namespace of the restore job and its repository
    pub namespace: String,

    /// Name of the restore job to process
    pub restore_job: String,

    /// Identity of this contender (its pod name)
    pub pod_name: String,

    pub mode: ExecutionMode,

    pub lease: LeaseTimings,

    pub setup: SetupOptions,

    pub status_retry: StatusRetryPolicy,
}

impl CoordinatorConfig {
    /// Create a configuration with default lease timings and exclusive mode
    pub fn new(namespace: &str, restore_job: &str, pod_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            restore_job: restore_job.to_string(),
            pod_name: pod_name.to_string(),
            mode: ExecutionMode::default(),
            lease: LeaseTimings::default(),
            setup: SetupOptions::default(),
            status_retry: StatusRetryPolicy::default(),
        }
    }

    /// Set the execution mode
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set lease timings
    pub fn lease(mut self, lease: LeaseTimings) -> Self {
        self.lease = lease;
        self
    }

    /// Set repository setup options
    pub fn setup(mut self, setup: SetupOptions) -> Self {
        self.setup = setup;
        self
    }

    /// Set the status update retry policy
    pub fn status_retry(mut self, policy: StatusRetryPolicy) -> Self {
        self.status_retry = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("restore job name", &self.restore_job),
            ("pod name", &self.pod_name),
        ] {
            if value.trim().is_empty() {
                return Err(RestoreError::Config(format!("{field} must not be empty")));
            }
        }
        if self.mode.requires_mutex() {
            self.lease.validate()?;
        }
        Ok(())
    }
}
