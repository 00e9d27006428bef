use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use saga_scheduler::cluster::{ClusterView, InMemoryCluster};
use saga_scheduler::config::{AppConfig, ClusterConfig, SagaLogConfig};
use saga_scheduler::node::SchedulerNode;
use saga_scheduler::saga::{FileSagaLog, MemorySagaLog, SagaLog};
use saga_scheduler::scheduler::{Job, JobSpec, RecoveryCoordinator, SchedulerState, TaskState};
use saga_scheduler::shutdown::install_shutdown_handler;
use saga_scheduler::stats;
use saga_scheduler::worker::{HeartbeatSender, SimulatedExecutor, WorkerPool};
use saga_scheduler::SchedulerError;

const COMMAND_BUFFER: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "saga-scheduler")]
#[command(version)]
#[command(about = "Task scheduler with a write-ahead saga log and crash recovery")]
#[command(propagate_version = true)]
struct Args {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Recover from the saga log and run the scheduler with simulated workers
    Serve(ServeArgs),

    /// Replay a saga log file and print the recovered jobs
    Inspect {
        log: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Rewrite a saga log file keeping only unfinished jobs
    Compact { log: PathBuf },
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Preset name (local.memory, local.file), inline JSON, or a config file path
    #[arg(long, short = 'c', default_value = "local.memory")]
    config: String,

    /// JSON file with an array of jobs to submit after startup
    #[arg(long)]
    jobs: Option<PathBuf>,

    /// Exit once every job has finished
    #[arg(long)]
    until_idle: bool,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct InspectOutput<'a> {
    last_seq: Option<u64>,
    jobs: Vec<&'a Job>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match args.command {
        Commands::Serve(serve) => run_server(serve).await,
        Commands::Inspect { log, output } => inspect(log, output),
        Commands::Compact { log } => compact(log),
    }
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load(&args.config)?;
    stats::register_metrics();

    let log: Arc<dyn SagaLog> = match &config.saga_log {
        SagaLogConfig::Memory => Arc::new(MemorySagaLog::new()),
        SagaLogConfig::File { path } => Arc::new(FileSagaLog::open(path)?),
    };

    let ClusterConfig::InMemory { count, capacity } = &config.cluster;
    let members = InMemoryCluster::new(*count, capacity.clone());
    let mut view = ClusterView::new();
    let now = Instant::now();
    for event in members.join_events() {
        view.apply(event, now);
    }

    tracing::info!(
        saga_log = ?config.saga_log,
        workers = *count,
        retry_budget = config.scheduler.retry_budget,
        "Starting saga-scheduler"
    );

    let (scheduler, _report) = RecoveryCoordinator::new(config.scheduler.clone(), log)
        .with_cluster(view)
        .recover()?;

    let shutdown = install_shutdown_handler();
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let (node, handle) = SchedulerNode::new(scheduler, commands_tx);
    let interval = config.scheduler.scheduling_interval();

    let pool = WorkerPool::new(SimulatedExecutor::new(config.workers.clone()), handle.clone());
    tokio::spawn(pool.run(commands_rx, shutdown.clone()));

    let heartbeat = HeartbeatSender::new(config.workers.heartbeat_interval());
    let (hb_handle, hb_shutdown) = (handle.clone(), shutdown.clone());
    tokio::spawn(async move {
        heartbeat.run(members, hb_handle, hb_shutdown).await;
    });

    let node_task = tokio::spawn(node.run(shutdown.clone()));

    if let Some(path) = args.jobs {
        let specs: Vec<JobSpec> = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        for spec in specs {
            match handle.submit_job(spec).await {
                Ok(job_id) => tracing::info!(job_id = %job_id, "Submitted job from file"),
                Err(e) => tracing::warn!(error = %e, "Job rejected"),
            }
        }
    }

    if args.until_idle {
        let (idle_handle, idle_shutdown) = (handle.clone(), shutdown.clone());
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval.max(Duration::from_millis(100))).await;
                match idle_handle.jobs().await {
                    Ok(jobs) if jobs.iter().all(|j| j.state.is_terminal()) => {
                        tracing::info!(jobs = jobs.len(), "All jobs finished");
                        idle_shutdown.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });
    }
    drop(handle);

    node_task.await??;
    Ok(())
}

fn inspect(path: PathBuf, output: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let log = FileSagaLog::open(&path)?;
    let state = SchedulerState::replay(log.replay()?.map(|e| e.map_err(SchedulerError::from)))?;

    match output {
        OutputFormat::Json => {
            let output = InspectOutput {
                last_seq: state.last_seq(),
                jobs: state.jobs().collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if state.job_count() == 0 {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<13} {:<7} {:<7} FAILURE", "JOB ID", "STATE", "TASKS", "DONE");
            println!("{}", "-".repeat(80));
            for job in state.jobs() {
                let done = job
                    .tasks
                    .iter()
                    .filter(|t| t.state == TaskState::Succeeded)
                    .count();
                println!(
                    "{:<38} {:<13} {:<7} {:<7} {}",
                    job.id,
                    job.state.to_string(),
                    job.tasks.len(),
                    done,
                    job.failure.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{} entries, {} jobs", log.len(), state.job_count());
        }
    }
    Ok(())
}

fn compact(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let log = FileSagaLog::open(&path)?;
    let state = SchedulerState::replay(log.replay()?.map(|e| e.map_err(SchedulerError::from)))?;

    let before = log.len();
    let archived = state.jobs().filter(|j| j.state.is_terminal()).count();
    log.compact(state.snapshot_entries())?;

    println!(
        "Compacted {}: {} -> {} entries, {} finished jobs archived",
        path.display(),
        before,
        log.len(),
        archived
    );
    Ok(())
}
