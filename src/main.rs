use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use restoregate::config::{
    ENV_NAMESPACE, ENV_POD_NAME, ENV_RESTORE_MODEL, ENV_RESTORE_SESSION,
};
use restoregate::events::FileEventSink;
use restoregate::{
    CommandTransferEngine, CoordinatorConfig, ExecutionMode, FileStateStore, LeaseTimings,
    Repository, RestoreCoordinator, RestoreJob, RestoreStateClient, SetupOptions,
    TextfileMetricsReporter, exit_code,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "restoregate")]
#[command(about = "Coordinates exactly-once restores across workload replicas")]
struct Cli {
    /// Directory shared by all contenders, holding jobs, repositories and leases
    #[arg(long, env = "RESTOREGATE_STATE_DIR", global = true, default_value = "/var/lib/restoregate")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Restore this contender's host
    Run(RunArgs),
    /// Print the status of a restore job
    Status {
        #[arg(long, env = ENV_NAMESPACE)]
        namespace: String,
        #[arg(long, env = ENV_RESTORE_SESSION)]
        restore_job: String,
    },
    /// Store a restore job or repository document in the state directory
    Apply {
        #[arg(long)]
        restore_job: Option<PathBuf>,
        #[arg(long)]
        repository: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, env = ENV_NAMESPACE)]
    namespace: String,

    #[arg(long, env = ENV_RESTORE_SESSION)]
    restore_job: String,

    #[arg(long, env = ENV_POD_NAME)]
    pod_name: String,

    /// `init-container` (exclusive) or `job` (non-exclusive)
    #[arg(long, env = ENV_RESTORE_MODEL, default_value = "init-container")]
    restore_model: ExecutionMode,

    #[arg(long, default_value = "/etc/repository/secret")]
    secret_dir: PathBuf,

    #[arg(long, default_value = "/tmp")]
    scratch_dir: PathBuf,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_cache: bool,

    #[arg(long, default_value_t = 15_000)]
    lease_duration_ms: u64,

    #[arg(long, default_value_t = 10_000)]
    renew_deadline_ms: u64,

    #[arg(long, default_value_t = 2_000)]
    retry_period_ms: u64,

    /// Restore program invoked for each snapshot or path
    #[arg(long, default_value = "restic")]
    program: String,

    /// Prometheus textfile to write restore metrics to, instead of logging them
    #[arg(long, env = "RESTOREGATE_METRICS_FILE")]
    metrics_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let store = FileStateStore::new(&cli.state_dir);

    match cli.command {
        Command::Run(args) => run(store, &cli.state_dir, args).await,
        Command::Status {
            namespace,
            restore_job,
        } => {
            let job = store
                .get_restore_job(&namespace, &restore_job)
                .await
                .with_context(|| format!("reading RestoreJob {namespace}/{restore_job}"))?;
            println!("{}", serde_json::to_string_pretty(&job.status)?);
            Ok(())
        }
        Command::Apply {
            restore_job,
            repository,
        } => apply(&store, restore_job.as_deref(), repository.as_deref()).await,
    }
}

async fn run(store: FileStateStore, state_dir: &Path, args: RunArgs) -> Result<()> {
    let setup = SetupOptions {
        secret_dir: args.secret_dir,
        scratch_dir: args.scratch_dir,
        enable_cache: args.enable_cache,
        ..SetupOptions::default()
    }
    .with_env_priorities()?;
    let lease = LeaseTimings::new(
        Duration::from_millis(args.lease_duration_ms),
        Duration::from_millis(args.renew_deadline_ms),
        Duration::from_millis(args.retry_period_ms),
    );
    let config = CoordinatorConfig::new(&args.namespace, &args.restore_job, &args.pod_name)
        .mode(args.restore_model)
        .lease(lease)
        .setup(setup);

    let store = Arc::new(store);
    let events = FileEventSink::new(state_dir.join(&args.namespace).join("events.jsonl"));
    let coordinator = RestoreCoordinator::new(
        config,
        store.clone(),
        store,
        Arc::new(CommandTransferEngine::new(args.program)),
    )
    .events(Arc::new(events));
    let coordinator = match args.metrics_file {
        Some(path) => coordinator.metrics(Arc::new(TextfileMetricsReporter::new(path))),
        None => coordinator,
    };

    let result = coordinator.run().await;
    match &result {
        Ok(report) => {
            tracing::info!(host = %report.hostname, outcome = ?report.outcome, "restore finished");
        }
        Err(err) => {
            tracing::error!(error = %err, "restore failed");
        }
    }
    let code = exit_code(&result);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn apply(
    store: &FileStateStore,
    restore_job: Option<&Path>,
    repository: Option<&Path>,
) -> Result<()> {
    if restore_job.is_none() && repository.is_none() {
        return Err(anyhow!("nothing to apply, pass --restore-job and/or --repository"));
    }
    if let Some(path) = repository {
        let repository: Repository = read_json(path).await?;
        store.put_repository(&repository).await?;
        println!("repository {}/{} stored", repository.namespace, repository.name);
    }
    if let Some(path) = restore_job {
        let job: RestoreJob = read_json(path).await?;
        let stored = store.put_restore_job(job).await?;
        println!(
            "restorejob {} stored at version {}",
            stored.key(),
            stored.resource_version
        );
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
