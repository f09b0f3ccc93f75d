//! Restore metrics, reported once an outcome is durably recorded.
//!
//! Like events, reporting is best-effort and never changes the outcome of a
//! restore.

use crate::core::{HostRestorePhase, HostRestoreStat, JobRef, RestoreJobStatus, RestorePhase, Result};
use crate::state::file::atomic_write;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One host's recorded outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMetrics {
    pub job: JobRef,
    pub hostname: String,
    pub phase: HostRestorePhase,
    pub duration: Option<String>,
    pub bytes_restored: Option<u64>,
}

impl HostMetrics {
    pub fn from_stat(job: &JobRef, stat: &HostRestoreStat) -> Self {
        Self {
            job: job.clone(),
            hostname: stat.hostname.clone(),
            phase: stat.phase,
            duration: stat.duration.clone(),
            bytes_restored: stat.bytes_restored,
        }
    }
}

/// The resolved session, reported by the contender whose write resolved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetrics {
    pub job: JobRef,
    pub phase: RestorePhase,
    pub total_hosts: u32,
    pub succeeded_hosts: u32,
    pub failed_hosts: u32,
    pub session_duration: Duration,
}

impl SessionMetrics {
    pub fn from_status(job: &JobRef, status: &RestoreJobStatus, session_duration: Duration) -> Self {
        let failed = status.stats.iter().filter(|s| s.is_failed()).count() as u32;
        let succeeded = status.stats.len() as u32 - failed;
        Self {
            job: job.clone(),
            phase: status.phase,
            total_hosts: status.total_hosts.unwrap_or(succeeded + failed),
            succeeded_hosts: succeeded,
            failed_hosts: failed,
            session_duration,
        }
    }
}

#[async_trait]
pub trait MetricsReporter: Send + Sync {
    async fn report_host(&self, metrics: HostMetrics) -> Result<()>;
    async fn report_session(&self, metrics: SessionMetrics) -> Result<()>;
}

/// Reports host metrics, logging instead of propagating a reporter failure.
pub async fn report_host_best_effort(reporter: &dyn MetricsReporter, metrics: HostMetrics) {
    let host = metrics.hostname.clone();
    let job = metrics.job.clone();
    if let Err(err) = reporter.report_host(metrics).await {
        log::error!("Failed to report metrics for host {} of {}. Reason: {}", host, job, err);
    }
}

/// Reports session metrics, logging instead of propagating a reporter failure.
pub async fn report_session_best_effort(reporter: &dyn MetricsReporter, metrics: SessionMetrics) {
    let job = metrics.job.clone();
    if let Err(err) = reporter.report_session(metrics).await {
        log::error!("Failed to report session metrics for {}. Reason: {}", job, err);
    }
}

/// Writes metrics to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogMetricsReporter;

#[async_trait]
impl MetricsReporter for LogMetricsReporter {
    async fn report_host(&self, m: HostMetrics) -> Result<()> {
        log::info!(
            "[{}] host {} {:?}, duration {}, {} bytes restored",
            m.job,
            m.hostname,
            m.phase,
            m.duration.as_deref().unwrap_or("-"),
            m.bytes_restored.unwrap_or_default()
        );
        Ok(())
    }

    async fn report_session(&self, m: SessionMetrics) -> Result<()> {
        log::info!(
            "[{}] session {} after {:.3}s, {}/{} hosts succeeded, {} failed",
            m.job,
            m.phase,
            m.session_duration.as_secs_f64(),
            m.succeeded_hosts,
            m.total_hosts,
            m.failed_hosts
        );
        Ok(())
    }
}

/// Keeps reported metrics in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsReporter {
    hosts: Arc<Mutex<Vec<HostMetrics>>>,
    sessions: Arc<Mutex<Vec<SessionMetrics>>>,
}

impl InMemoryMetricsReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn hosts(&self) -> Vec<HostMetrics> {
        self.hosts.lock().await.clone()
    }

    pub async fn sessions(&self) -> Vec<SessionMetrics> {
        self.sessions.lock().await.clone()
    }
}

#[async_trait]
impl MetricsReporter for InMemoryMetricsReporter {
    async fn report_host(&self, metrics: HostMetrics) -> Result<()> {
        self.hosts.lock().await.push(metrics);
        Ok(())
    }

    async fn report_session(&self, metrics: SessionMetrics) -> Result<()> {
        self.sessions.lock().await.push(metrics);
        Ok(())
    }
}

/// Renders metrics in the Prometheus text format into a file, for a
/// node-exporter style textfile collector.
///
/// The file holds the samples reported by this process, rewritten atomically
/// on every report.
#[derive(Debug, Clone)]
pub struct TextfileMetricsReporter {
    path: PathBuf,
    samples: Arc<Mutex<BTreeMap<String, f64>>>,
}

impl TextfileMetricsReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            samples: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    async fn update(&self, samples: Vec<(String, f64)>) -> Result<()> {
        let mut current = self.samples.lock().await;
        current.extend(samples);
        atomic_write(&self.path, render(&current).as_bytes()).await
    }
}

fn render(samples: &BTreeMap<String, f64>) -> String {
    let mut out = String::new();
    let mut last_name = "";
    for (series, value) in samples {
        let name = series.split('{').next().unwrap_or(series);
        if name != last_name {
            let _ = writeln!(out, "# TYPE {name} gauge");
            last_name = name;
        }
        let _ = writeln!(out, "{series} {value}");
    }
    out
}

fn labels(job: &JobRef) -> String {
    format!("namespace=\"{}\",restore_job=\"{}\"", job.namespace, job.name)
}

#[async_trait]
impl MetricsReporter for TextfileMetricsReporter {
    async fn report_host(&self, m: HostMetrics) -> Result<()> {
        let labels = format!("{},host=\"{}\"", labels(&m.job), m.hostname);
        let success = if m.phase == HostRestorePhase::Succeeded { 1.0 } else { 0.0 };
        let mut samples = vec![(format!("restoregate_host_restore_success{{{labels}}}"), success)];
        if let Some(bytes) = m.bytes_restored {
            samples.push((
                format!("restoregate_host_restore_bytes{{{labels}}}"),
                bytes as f64,
            ));
        }
        self.update(samples).await
    }

    async fn report_session(&self, m: SessionMetrics) -> Result<()> {
        let labels = labels(&m.job);
        let success = if m.phase == RestorePhase::Succeeded { 1.0 } else { 0.0 };
        self.update(vec![
            (format!("restoregate_session_success{{{labels}}}"), success),
            (
                format!("restoregate_session_duration_seconds{{{labels}}}"),
                m.session_duration.as_secs_f64(),
            ),
            (
                format!("restoregate_session_total_hosts{{{labels}}}"),
                f64::from(m.total_hosts),
            ),
            (
                format!("restoregate_session_failed_hosts{{{labels}}}"),
                f64::from(m.failed_hosts),
            ),
        ])
        .await
    }
}
