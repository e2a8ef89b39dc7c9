//! CLI command definitions for recon-queue.
//!
//! Each subcommand wires the configured backends together and delegates to
//! the scheduler. Connection settings come from flags or the environment
//! (see [`crate::config`]).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{
    ExecutorConfig, QueueConfig, ScanAuthorization, StoreConfig, WorkerArgs, WorkerConfig,
};
use crate::retry::RetryPolicy;
use crate::runner::{MockExecutor, ProcessSupervisor, ScanExecutor};
use crate::scheduler::{
    JobQueue, JobRecord, MemoryQueue, MemoryStore, PollOutcome, Producer, Reconciler,
    StatusCache, WorkQueue, Worker, WorkerContext, WorkerPool,
};
use crate::storage::{Database, JobStore, MigrationRunner};

/// Scan job queue: producer, supervised worker pool and stuck-job reconciler.
#[derive(Parser)]
#[command(name = "recon-queue")]
#[command(about = "Queue, run and supervise reconnaissance scan jobs")]
#[command(version)]
#[command(
    long_about = "recon-queue moves scan jobs from a Redis list to a pool of workers that run the scan executor under a timeout and record the outcome in PostgreSQL.\n\nScans only run when ALLOW_SCANS=1 is set.\n\nExample usage:\n  recon-queue enqueue --target example.com --user-id u1\n  recon-queue worker --workers 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate a scan request and push it onto the work queue.
    Enqueue(EnqueueArgs),

    /// Show a job's cached and stored status.
    Status(StatusArgs),

    /// Run a pool of workers until SIGINT/SIGTERM.
    Worker(WorkerCommandArgs),

    /// Fail jobs stuck in `running` once.
    Reconcile(ReconcileArgs),

    /// Create or update the `scans` table.
    Migrate(MigrateArgs),

    /// Enqueue and run one job in-process, without Redis or PostgreSQL.
    Local(LocalArgs),
}

/// Arguments for `enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job identifier; a random UUID when omitted.
    #[arg(long)]
    pub job_id: Option<String>,

    /// Domain or address to scan.
    #[arg(short, long)]
    pub target: String,

    /// Owner of the scan.
    #[arg(short, long)]
    pub user_id: String,

    /// Also insert the `queued` row into PostgreSQL.
    #[arg(long)]
    pub record: bool,

    #[command(flatten)]
    pub queue: QueueConfig,

    #[command(flatten)]
    pub store: StoreConfig,
}

/// Arguments for `status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job identifier.
    pub job_id: String,

    /// Only read the Redis status cache.
    #[arg(long)]
    pub cache_only: bool,

    #[command(flatten)]
    pub queue: QueueConfig,

    #[command(flatten)]
    pub store: StoreConfig,
}

/// Arguments for `worker`.
#[derive(Parser, Debug)]
pub struct WorkerCommandArgs {
    /// Apply schema migrations before starting.
    #[arg(long)]
    pub migrate: bool,

    #[command(flatten)]
    pub worker: WorkerArgs,

    #[command(flatten)]
    pub executor: ExecutorConfig,

    #[command(flatten)]
    pub queue: QueueConfig,

    #[command(flatten)]
    pub store: StoreConfig,
}

/// Arguments for `reconcile`.
#[derive(Parser, Debug)]
pub struct ReconcileArgs {
    /// A running job with no update for this many seconds is failed.
    #[arg(long, env = "STALE_AFTER_SECS", default_value_t = 1800)]
    pub stale_after_secs: u64,

    #[command(flatten)]
    pub queue: QueueConfig,

    #[command(flatten)]
    pub store: StoreConfig,
}

/// Arguments for `migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Drop the tables first. Destroys all job data.
    #[arg(long)]
    pub reset: bool,

    #[command(flatten)]
    pub store: StoreConfig,
}

/// Arguments for `local`.
#[derive(Parser, Debug)]
pub struct LocalArgs {
    /// Domain or address to scan.
    #[arg(short, long)]
    pub target: String,

    /// Owner of the scan.
    #[arg(short, long, default_value = "local")]
    pub user_id: String,

    /// Job identifier; a random UUID when omitted.
    #[arg(long)]
    pub job_id: Option<String>,

    /// Wall-clock limit for the scan, in seconds.
    #[arg(long, env = "SCAN_TIMEOUT_SECS", default_value_t = 1800)]
    pub scan_timeout_secs: u64,

    #[command(flatten)]
    pub executor: ExecutorConfig,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Reconcile(args) => run_reconcile_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
        Commands::Local(args) => run_local_command(args).await,
    }
}

// ============================================================================
// Enqueue
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct EnqueueOutput {
    success: bool,
    job_id: String,
    queue_position: usize,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct FailureOutput {
    success: bool,
    error: String,
}

/// Prints `{success, job_id, queue_position, message}` on stdout, or
/// `{success: false, error}` on stderr and exits with status 1.
async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    let job_id = args
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match enqueue(&args, &job_id).await {
        Ok(queue_position) => {
            let output = EnqueueOutput {
                success: true,
                job_id,
                queue_position,
                message: "Job queued successfully".to_string(),
            };
            println!("{}", serde_json::to_string(&output)?);
            Ok(())
        }
        Err(e) => {
            let output = FailureOutput {
                success: false,
                error: format!("{:#}", e),
            };
            eprintln!("{}", serde_json::to_string(&output)?);
            std::process::exit(1);
        }
    }
}

async fn enqueue(args: &EnqueueArgs, job_id: &str) -> anyhow::Result<usize> {
    let queue = Arc::new(JobQueue::connect(&args.queue, RetryPolicy::startup()).await?);
    let mut producer = Producer::new(queue.clone(), queue, ScanAuthorization::from_env());

    if args.record {
        let db = Database::connect(&args.store, RetryPolicy::startup()).await?;
        producer = producer.with_store(Arc::new(db));
    }

    let position = producer
        .enqueue(job_id, &args.target, &args.user_id)
        .await?;
    Ok(position)
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
struct StatusOutput {
    job_id: String,
    cache: Option<std::collections::HashMap<String, String>>,
    record: Option<JobRecord>,
}

async fn run_status_command(args: StatusArgs) -> anyhow::Result<()> {
    let queue = JobQueue::connect(&args.queue, RetryPolicy::none()).await?;
    let cache = queue.get_status(&args.job_id).await?;

    let record = if args.cache_only {
        None
    } else {
        let db = Database::connect(&args.store, RetryPolicy::none()).await?;
        let record = db.get(&args.job_id).await?;
        db.close().await;
        record
    };

    let output = StatusOutput {
        job_id: args.job_id,
        cache,
        record,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

fn build_executor(config: &ExecutorConfig) -> anyhow::Result<Arc<dyn ScanExecutor>> {
    if config.mock {
        info!(results_dir = %config.results_dir().display(), "Using mock scan executor");
        return Ok(Arc::new(MockExecutor::new(config.results_dir())));
    }
    let supervisor =
        ProcessSupervisor::from_config(config).context("Invalid scan executor command")?;
    info!(command = %config.command, "Using process scan executor");
    Ok(Arc::new(supervisor))
}

async fn run_worker_command(args: WorkerCommandArgs) -> anyhow::Result<()> {
    let authorization = ScanAuthorization::from_env();
    if !authorization.is_granted() {
        warn!("ALLOW_SCANS is not set to 1; every job will fail authorization");
    }

    let db = Arc::new(
        Database::connect(&args.store, RetryPolicy::startup())
            .await
            .context("Could not connect to PostgreSQL")?,
    );
    if args.migrate {
        db.run_migrations().await?;
    }

    let num_workers = args.worker.workers.max(1);
    let cache = Arc::new(
        JobQueue::connect(&args.queue, RetryPolicy::startup())
            .await
            .context("Could not connect to Redis")?,
    );
    let cache_queue_name = cache.queue_name().to_string();
    let mut queues: Vec<Arc<dyn WorkQueue>> = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        queues.push(Arc::new(
            JobQueue::connect(&args.queue, RetryPolicy::startup()).await?,
        ));
    }

    let context = WorkerContext {
        cache,
        store: db.clone(),
        executor: build_executor(&args.executor)?,
        authorization,
        config: args.worker.into_config(),
    };

    info!(
        queue = %cache_queue_name,
        workers = num_workers,
        executor = %context.executor.name(),
        "Starting worker pool"
    );
    let mut pool = WorkerPool::new(context);
    pool.start(queues)?;

    shutdown_signal().await;
    info!("Shutdown signal received, waiting for in-flight jobs");

    let result = pool.shutdown().await;
    let stats = pool.stats();
    info!(
        jobs_completed = stats.jobs_completed,
        jobs_failed = stats.jobs_failed,
        entries_dropped = stats.entries_dropped,
        jobs_reconciled = stats.jobs_reconciled,
        "Worker pool stopped"
    );
    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Worker pool did not stop cleanly");
        return Err(e.into());
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

// ============================================================================
// Reconcile / Migrate
// ============================================================================

async fn run_reconcile_command(args: ReconcileArgs) -> anyhow::Result<()> {
    let db = Arc::new(Database::connect(&args.store, RetryPolicy::startup()).await?);
    let cache = Arc::new(JobQueue::connect(&args.queue, RetryPolicy::startup()).await?);

    let reconciler = Reconciler::new(
        db.clone(),
        cache,
        Duration::from_secs(args.stale_after_secs),
    );
    let failed = reconciler.reconcile_once().await?;
    db.close().await;

    let output = serde_json::json!({
        "status": "success",
        "failed": failed.len(),
        "job_ids": failed,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_migrate_command(args: MigrateArgs) -> anyhow::Result<()> {
    let db = Database::connect(&args.store, RetryPolicy::startup()).await?;
    let runner = MigrationRunner::new(db.pool().clone());

    if args.reset {
        warn!(database = %args.store.database, "Dropping scan tables");
        runner.reset_database().await?;
    }
    let applied = runner.run_migrations().await?;
    db.close().await;

    info!(applied = applied, "Migrations complete");
    println!("Schema up to date ({} statements applied)", applied);
    Ok(())
}

// ============================================================================
// Local
// ============================================================================

async fn run_local_command(args: LocalArgs) -> anyhow::Result<()> {
    let job_id = args
        .job_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let authorization = ScanAuthorization::from_env();

    let queue = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryStore::new());

    Producer::new(queue.clone(), queue.clone(), authorization)
        .with_store(store.clone())
        .enqueue(&job_id, &args.target, &args.user_id)
        .await?;

    let context = WorkerContext {
        cache: queue.clone(),
        store: store.clone(),
        executor: build_executor(&args.executor)?,
        authorization,
        config: WorkerConfig::default()
            .with_job_timeout(Duration::from_secs(args.scan_timeout_secs))
            .with_store_retry(RetryPolicy::none()),
    };
    // Never signalled: the single poll below is the whole run.
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let worker = Worker::new("local", queue, context, shutdown_rx);

    let outcome = worker.poll_once().await?;
    let record = store.get(&job_id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    match outcome {
        PollOutcome::Completed { .. } => Ok(()),
        PollOutcome::Failed { message, .. } => Err(anyhow::anyhow!("Scan failed: {}", message)),
        other => Err(anyhow::anyhow!("Unexpected outcome: {:?}", other)),
    }
}
