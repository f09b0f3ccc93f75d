use super::{DataTransferEngine, HostRestoreOptions, RepositoryConnection, RestoreOutput};
use crate::core::{HostRestoreStat, RestoreError, Result};
use async_trait::async_trait;
use std::time::Instant;
use tokio::process::Command;
use tracing::{Level, event};

const PASSWORD_FILE: &str = "RESTIC_PASSWORD";
const RESTORE_TARGET: &str = "/";

/// One external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Runs an external restic-compatible program, one invocation per snapshot,
/// or per path when no snapshots are pinned.
#[derive(Debug, Clone)]
pub struct CommandTransferEngine {
    program: String,
}

impl Default for CommandTransferEngine {
    fn default() -> Self {
        Self::new("restic")
    }
}

impl CommandTransferEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn plan(
        &self,
        connection: &RepositoryConnection,
        options: &HostRestoreOptions,
    ) -> Vec<Invocation> {
        let mut env = vec![
            ("RESTIC_REPOSITORY".to_string(), connection.url.clone()),
            (
                "RESTIC_PASSWORD_FILE".to_string(),
                connection.secret_dir.join(PASSWORD_FILE).display().to_string(),
            ),
        ];
        if connection.enable_cache {
            env.push((
                "RESTIC_CACHE_DIR".to_string(),
                connection.scratch_dir.join("restic-cache").display().to_string(),
            ));
        }

        let mut restores = Vec::new();
        if options.snapshots.is_empty() {
            for path in &options.restore_paths {
                restores.push(vec![
                    "restore".to_string(),
                    "latest".to_string(),
                    "--host".to_string(),
                    options.source_host.clone(),
                    "--path".to_string(),
                    path.clone(),
                    "--target".to_string(),
                    RESTORE_TARGET.to_string(),
                ]);
            }
        } else {
            for snapshot in &options.snapshots {
                restores.push(vec![
                    "restore".to_string(),
                    snapshot.clone(),
                    "--target".to_string(),
                    RESTORE_TARGET.to_string(),
                ]);
            }
        }

        restores
            .into_iter()
            .map(|mut restic_args| {
                if !connection.enable_cache {
                    restic_args.push("--no-cache".to_string());
                }
                let (program, args) = self.wrap_priorities(connection, restic_args);
                Invocation {
                    program,
                    args,
                    env: env.clone(),
                }
            })
            .collect()
    }

    fn wrap_priorities(
        &self,
        connection: &RepositoryConnection,
        restic_args: Vec<String>,
    ) -> (String, Vec<String>) {
        let mut command = Vec::new();
        if let Some(nice) = connection.nice {
            command.extend(["nice".to_string(), "-n".to_string(), nice.adjustment.to_string()]);
        }
        if let Some(ionice) = connection.ionice {
            command.extend(["ionice".to_string(), "-c".to_string(), ionice.class.to_string()]);
            if let Some(data) = ionice.class_data {
                command.extend(["-n".to_string(), data.to_string()]);
            }
        }
        command.push(self.program.clone());
        command.extend(restic_args);
        let program = command.remove(0);
        (program, command)
    }
}

#[async_trait]
impl DataTransferEngine for CommandTransferEngine {
    async fn restore(
        &self,
        connection: &RepositoryConnection,
        options: &HostRestoreOptions,
    ) -> Result<RestoreOutput> {
        let started = Instant::now();
        for invocation in self.plan(connection, options) {
            event!(
                Level::DEBUG,
                program = %invocation.program,
                args = ?invocation.args,
                "running restore command"
            );
            let output = Command::new(&invocation.program)
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .output()
                .await
                .map_err(|err| {
                    RestoreError::Transfer(format!(
                        "failed to start '{}': {}",
                        invocation.program, err
                    ))
                })?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                return Err(RestoreError::Transfer(if stderr.is_empty() {
                    format!("'{}' exited with {}", invocation.program, output.status)
                } else {
                    stderr
                }));
            }
        }
        let duration = started.elapsed();
        Ok(RestoreOutput {
            host_stats: vec![HostRestoreStat::succeeded(&options.host).with_duration(duration)],
            duration,
        })
    }
}
