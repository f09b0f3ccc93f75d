//! Boundary to the engine that moves data out of the repository.

use crate::config::{IoNiceSettings, NiceSettings, SetupOptions};
use crate::core::{HostRestoreStat, Repository, RestoreError, RestoreRule, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

pub mod command;

pub use command::CommandTransferEngine;

/// Host-scoped restore parameters derived from a job's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRestoreOptions {
    /// Host being restored.
    pub host: String,
    /// Host whose snapshots are read. Defaults to `host`.
    pub source_host: String,
    pub restore_paths: Vec<String>,
    pub snapshots: Vec<String>,
}

/// Picks the rule that applies to `host`.
///
/// A rule naming the host in `target_hosts` wins over a catch-all rule with
/// empty `target_hosts`; among catch-alls the first one applies. With no
/// matching rule the options restore nothing.
pub fn restore_options_for_host(host: &str, rules: &[RestoreRule]) -> HostRestoreOptions {
    let specific = rules
        .iter()
        .find(|rule| rule.target_hosts.iter().any(|target| target == host));
    let matched = specific.or_else(|| rules.iter().find(|rule| rule.target_hosts.is_empty()));

    match matched {
        Some(rule) => HostRestoreOptions {
            host: host.to_string(),
            source_host: rule
                .source_host
                .clone()
                .filter(|source| !source.is_empty())
                .unwrap_or_else(|| host.to_string()),
            restore_paths: rule.paths.clone(),
            snapshots: rule.snapshots.clone(),
        },
        None => HostRestoreOptions {
            host: host.to_string(),
            source_host: host.to_string(),
            restore_paths: Vec::new(),
            snapshots: Vec::new(),
        },
    }
}

/// Everything the engine needs to open the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConnection {
    pub repository: String,
    pub url: String,
    pub host: String,
    pub secret_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub enable_cache: bool,
    pub nice: Option<NiceSettings>,
    pub ionice: Option<IoNiceSettings>,
}

impl RepositoryConnection {
    pub fn for_repository(repository: &Repository, host: &str, setup: &SetupOptions) -> Result<Self> {
        let url = repository.backend.url.trim();
        if url.is_empty() {
            return Err(RestoreError::Config(format!(
                "Repository {}/{} has no backend url",
                repository.namespace, repository.name
            )));
        }
        Ok(Self {
            repository: format!("{}/{}", repository.namespace, repository.name),
            url: url.to_string(),
            host: host.to_string(),
            secret_dir: setup.secret_dir.clone(),
            scratch_dir: setup.scratch_dir.clone(),
            enable_cache: setup.enable_cache,
            nice: setup.nice,
            ionice: setup.ionice,
        })
    }
}

/// Result of a successful restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutput {
    pub host_stats: Vec<HostRestoreStat>,
    pub duration: Duration,
}

impl RestoreOutput {
    /// Stat reported for `host`, or a bare success entry if the engine reported none.
    pub fn stat_for(&self, host: &str) -> HostRestoreStat {
        self.host_stats
            .iter()
            .find(|stat| stat.hostname == host)
            .cloned()
            .unwrap_or_else(|| HostRestoreStat::succeeded(host).with_duration(self.duration))
    }
}

/// Performs the actual data restore. Treated as non-idempotent and never retried.
#[async_trait]
pub trait DataTransferEngine: Send + Sync {
    async fn restore(
        &self,
        connection: &RepositoryConnection,
        options: &HostRestoreOptions,
    ) -> Result<RestoreOutput>;
}
