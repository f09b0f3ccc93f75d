//! Diagnostic events keyed to a restore job.
//!
//! Event delivery is best-effort: a sink failure is logged and never changes
//! the outcome of a restore.

use crate::core::{JobRef, RestoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const EVENT_SOURCE_RESTORE: &str = "restore-coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    HostRestoreSucceeded,
    HostRestoreFailed,
    RestoreSessionSucceeded,
    RestoreSessionFailed,
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::HostRestoreSucceeded => "HostRestoreSucceeded",
            Self::HostRestoreFailed => "HostRestoreFailed",
            Self::RestoreSessionSucceeded => "RestoreSessionSucceeded",
            Self::RestoreSessionFailed => "RestoreSessionFailed",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreEvent {
    pub id: Uuid,
    /// `namespace/name` of the restore job.
    pub object: String,
    pub event_type: EventType,
    pub reason: EventReason,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl RestoreEvent {
    pub fn new(job: &JobRef, event_type: EventType, reason: EventReason, message: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            object: job.to_string(),
            event_type,
            reason,
            message,
            source: EVENT_SOURCE_RESTORE.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: RestoreEvent) -> Result<()>;
}

/// Records `event`, logging instead of propagating a sink failure.
pub async fn emit_best_effort(sink: &dyn EventSink, event: RestoreEvent) {
    let reason = event.reason;
    let object = event.object.clone();
    if let Err(err) = sink.record(event).await {
        log::error!("Failed to write {} event for {}. Reason: {}", reason, object, err);
    }
}

/// Writes events to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn record(&self, event: RestoreEvent) -> Result<()> {
        match event.event_type {
            EventType::Normal => {
                log::info!("[{}] {}: {}", event.object, event.reason, event.message)
            }
            EventType::Warning => {
                log::warn!("[{}] {}: {}", event.object, event.reason, event.message)
            }
        }
        Ok(())
    }
}

/// Keeps events in memory, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSink {
    events: Arc<Mutex<Vec<RestoreEvent>>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RestoreEvent> {
        self.events.lock().await.clone()
    }

    pub async fn reasons(&self) -> Vec<EventReason> {
        self.events.lock().await.iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn record(&self, event: RestoreEvent) -> Result<()> {
        self.events.lock().await.push(event);
        Ok(())
    }
}

/// Appends events as JSON lines to a file shared by all contenders.
#[derive(Debug, Clone)]
pub struct FileEventSink {
    path: PathBuf,
}

impl FileEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventSink for FileEventSink {
    async fn record(&self, event: RestoreEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|err| {
                RestoreError::Io(format!(
                    "Failed to open event log '{}': {}",
                    self.path.display(),
                    err
                ))
            })?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RestoreJob, RestoreTarget, TargetKind};

    struct BrokenSink;

    #[async_trait]
    impl EventSink for BrokenSink {
        async fn record(&self, _event: RestoreEvent) -> Result<()> {
            Err(RestoreError::Backend("event api unavailable".to_string()))
        }
    }

    fn job() -> JobRef {
        RestoreJob::new(
            "demo",
            "restore",
            RestoreTarget::new(TargetKind::Deployment, "web"),
            "repo",
        )
        .job_ref()
    }

    #[tokio::test]
    async fn best_effort_swallows_sink_failures() {
        let event = RestoreEvent::new(
            &job(),
            EventType::Warning,
            EventReason::HostRestoreFailed,
            "boom".to_string(),
        );
        emit_best_effort(&BrokenSink, event).await;
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileEventSink::new(dir.path().join("demo").join("events.jsonl"));
        for reason in [EventReason::HostRestoreSucceeded, EventReason::RestoreSessionSucceeded] {
            sink.record(RestoreEvent::new(&job(), EventType::Normal, reason, "ok".to_string()))
                .await
                .unwrap();
        }

        let content = tokio::fs::read_to_string(dir.path().join("demo").join("events.jsonl"))
            .await
            .unwrap();
        let events = content
            .lines()
            .map(|line| serde_json::from_str::<RestoreEvent>(line).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].reason, EventReason::RestoreSessionSucceeded);
        assert_eq!(events[0].object, "demo/restore");
    }
}
