//! Which host a contender restores, and how many hosts a job expects.

use crate::core::{RestoreError, RestoreTarget, Result, TargetKind};
use async_trait::async_trait;

const HOST_PREFIX: &str = "host";

/// Resolves the hostname this contender is responsible for.
///
/// Depends only on the target and the pod name, so a restarted contender
/// resolves to the same host.
pub fn hostname_for(target: &RestoreTarget, pod_name: &str) -> Result<String> {
    match &target.reference.kind {
        TargetKind::StatefulSet => {
            let ordinal = pod_name
                .rsplit_once('-')
                .and_then(|(_, suffix)| suffix.parse::<u32>().ok())
                .ok_or_else(|| {
                    RestoreError::Config(format!(
                        "cannot derive StatefulSet ordinal from pod name '{pod_name}'"
                    ))
                })?;
            Ok(format!("{HOST_PREFIX}-{ordinal}"))
        }
        TargetKind::PersistentVolumeClaim => Ok(target.reference.name.clone()),
        _ => Ok(format!("{HOST_PREFIX}-0")),
    }
}

/// Describes how many hosts a target workload restores.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    async fn expected_hosts(&self, target: &RestoreTarget) -> Result<u32>;
}

/// Reads the host count from the target itself.
///
/// Only a StatefulSet restores one host per replica; every other kind shares
/// a single host.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetReplicaTopology;

#[async_trait]
impl TopologyProvider for TargetReplicaTopology {
    async fn expected_hosts(&self, target: &RestoreTarget) -> Result<u32> {
        Ok(match target.reference.kind {
            TargetKind::StatefulSet => target.replicas.unwrap_or(1).max(1),
            _ => 1,
        })
    }
}
