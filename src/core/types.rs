use super::{RestoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Workload kinds a restore can target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TargetKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    ReplicationController,
    DeploymentConfig,
    PersistentVolumeClaim,
    Other(String),
}

impl TargetKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::ReplicaSet => "ReplicaSet",
            Self::ReplicationController => "ReplicationController",
            Self::DeploymentConfig => "DeploymentConfig",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::Other(kind) => kind.as_str(),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = RestoreError;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim() {
            "" => {
                return Err(RestoreError::Config(
                    "target kind must not be empty".to_string(),
                ));
            }
            "Deployment" => Self::Deployment,
            "DaemonSet" => Self::DaemonSet,
            "StatefulSet" => Self::StatefulSet,
            "ReplicaSet" => Self::ReplicaSet,
            "ReplicationController" => Self::ReplicationController,
            "DeploymentConfig" => Self::DeploymentConfig,
            "PersistentVolumeClaim" => Self::PersistentVolumeClaim,
            other => Self::Other(other.to_string()),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for TargetKind {
    type Error = RestoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TargetKind> for String {
    fn from(kind: TargetKind) -> Self {
        kind.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub name: String,
}

impl TargetRef {
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// The workload whose replicas compete to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreTarget {
    #[serde(rename = "ref")]
    pub reference: TargetRef,
    /// Replica count reported by the workload topology, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
}

impl RestoreTarget {
    pub fn new(kind: TargetKind, name: impl Into<String>) -> Self {
        Self {
            reference: TargetRef::new(kind, name),
            replicas: None,
        }
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = Some(replicas);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub name: String,
}

/// Per-path restore rule. Empty `target_hosts` matches every host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRule {
    #[serde(default)]
    pub target_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_host: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RestorePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRestorePhase {
    Succeeded,
    Failed,
}

/// Outcome of restoring one host. At most one entry per hostname exists in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRestoreStat {
    pub hostname: String,
    pub phase: HostRestorePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_restored: Option<u64>,
}

impl HostRestoreStat {
    pub fn succeeded(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            phase: HostRestorePhase::Succeeded,
            error: None,
            duration: None,
            bytes_restored: None,
        }
    }

    pub fn failed(hostname: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            phase: HostRestorePhase::Failed,
            error: Some(error.into()),
            duration: None,
            bytes_restored: None,
        }
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration = Some(format_duration(duration));
        self
    }

    pub fn with_bytes_restored(mut self, bytes: u64) -> Self {
        self.bytes_restored = Some(bytes);
        self
    }

    pub fn is_failed(&self) -> bool {
        self.phase == HostRestorePhase::Failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJobStatus {
    #[serde(default)]
    pub phase: RestorePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hosts: Option<u32>,
    #[serde(default)]
    pub stats: Vec<HostRestoreStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,
}

impl RestoreJobStatus {
    pub fn stat_for(&self, hostname: &str) -> Option<&HostRestoreStat> {
        self.stats.iter().find(|stat| stat.hostname == hostname)
    }

    /// Inserts or replaces the stat keyed by its hostname.
    pub fn upsert_stat(&mut self, stat: HostRestoreStat) {
        match self
            .stats
            .iter_mut()
            .find(|existing| existing.hostname == stat.hostname)
        {
            Some(existing) => *existing = stat,
            None => self.stats.push(stat),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<RestoreTarget>,
    pub repository: RepositoryRef,
    #[serde(default)]
    pub rules: Vec<RestoreRule>,
}

/// Namespace-qualified name of a restore job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobRef {
    pub namespace: String,
    pub name: String,
}

impl JobRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Declarative restore request shared by every replica of the target workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreJob {
    pub namespace: String,
    pub name: String,
    /// Optimistic concurrency token, bumped by the state store on every write.
    #[serde(default)]
    pub resource_version: u64,
    /// Set by the state store when the job is first stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub spec: RestoreJobSpec,
    #[serde(default)]
    pub status: RestoreJobStatus,
}

impl RestoreJob {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        target: RestoreTarget,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            creation_timestamp: None,
            spec: RestoreJobSpec {
                target: Some(target),
                repository: RepositoryRef {
                    name: repository.into(),
                },
                rules: Vec::new(),
            },
            status: RestoreJobStatus::default(),
        }
    }

    pub fn with_rule(mut self, rule: RestoreRule) -> Self {
        self.spec.rules.push(rule);
        self
    }

    /// Time since the job was created, zero when it carries no timestamp.
    pub fn age(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.creation_timestamp
            .and_then(|created| (now - created).to_std().ok())
            .unwrap_or_default()
    }

    /// `namespace/name`, used to key events and logs.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.namespace.clone(), self.name.clone())
    }

    pub fn target(&self) -> Result<&RestoreTarget> {
        self.spec.target.as_ref().ok_or_else(|| {
            RestoreError::Config(format!("invalid RestoreJob {}. Target is nil", self.key()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryBackend {
    /// Backend location, e.g. `s3:bucket/prefix` or `/mnt/backup`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_secret_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub namespace: String,
    pub name: String,
    pub backend: RepositoryBackend,
}

impl Repository {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            backend: RepositoryBackend {
                url: url.into(),
                storage_secret_name: None,
            },
        }
    }
}

/// Persisted state of a distributed lock.
///
/// An empty `holder_identity` means the previous holder stepped down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub holder_identity: String,
    pub lease_duration_ms: u64,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    #[serde(default)]
    pub leader_transitions: u32,
}

impl LockRecord {
    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }
}

/// A lock record paired with the store's concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedLock {
    pub resource_version: u64,
    pub record: LockRecord,
}

pub fn format_duration(duration: std::time::Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{millis}ms");
    }
    format!("{:.3}s", duration.as_secs_f64())
}
