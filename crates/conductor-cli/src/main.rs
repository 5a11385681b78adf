use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::app::{
    HandlerError, HandlerRegistry, Runtime, SweeperLoop, TaskHandler, WorkerGroup, WorkerOptions,
};
use conductor_core::domain::{Capability, ExecutionStatus, WorkerId};
use conductor_core::graph::{ExecutionPlan, TaskGraph};
use conductor_core::impls::KeywordDecomposer;
use conductor_core::ports::{SystemClock, UlidGenerator};
use conductor_core::queue::ClaimedTask;
use conductor_core::{SchedulerBuilder, SchedulerConfig};

/// Run objectives on a simulated in-process worker fleet.
#[derive(Debug, Parser)]
#[command(name = "conductor", version)]
struct Cli {
    /// TOML scheduler config; defaults plus CONDUCTOR_* overrides otherwise.
    #[arg(long, global = true, env = "CONDUCTOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decompose an objective and run it to completion.
    Run {
        objective: String,

        /// Number of simulated workers.
        #[arg(long, default_value_t = 3)]
        workers: usize,

        /// Simulated work time per task, in milliseconds.
        #[arg(long, default_value_t = 200)]
        work_ms: u64,

        /// Fail this many attempts per role with a transient error first.
        #[arg(long, default_value_t = 0)]
        flaky: u32,
    },

    /// Print the task graph an objective would produce, without running it.
    Plan { objective: String },
}

const ROLES: [&str; 3] = ["researcher", "content-writer", "analyst"];

/// Stand-in for a real agent: sleeps, then echoes the task.
struct SimulatedHandler {
    role: &'static str,
    work: Duration,
    failures_left: AtomicU32,
}

#[async_trait]
impl TaskHandler for SimulatedHandler {
    async fn handle(&self, task: &ClaimedTask) -> Result<String, HandlerError> {
        tokio::time::sleep(self.work).await;

        let left = self.failures_left.load(Ordering::Relaxed);
        if left > 0 {
            self.failures_left.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::transient(format!(
                "{} is busy (failures left={left})",
                self.role
            )));
        }
        Ok(format!("[{}] {}", self.role, task.description))
    }
}

#[derive(Debug, Serialize)]
struct PlanOutput<'a> {
    objective: &'a str,
    tasks: Vec<PlannedTask>,
    plan: ExecutionPlan,
}

#[derive(Debug, Serialize)]
struct PlannedTask {
    description: String,
    required_capability: Capability,
    priority: u8,
    depends_on: Vec<usize>,
}

fn load_config(path: Option<&PathBuf>) -> Result<SchedulerConfig> {
    let config = match path {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::from_env()?,
    };
    Ok(config)
}

async fn run(
    config: SchedulerConfig,
    objective: &str,
    workers: usize,
    work_ms: u64,
    flaky: u32,
) -> Result<ExecutionStatus> {
    if workers == 0 {
        bail!("--workers must be at least 1");
    }
    let options = WorkerOptions::for_config(&config);
    let scheduler = Arc::new(
        SchedulerBuilder::new()
            .config(config)
            .decomposer(KeywordDecomposer::default())
            .build()?,
    );

    let mut registry = HandlerRegistry::new();
    for role in ROLES {
        registry.register(
            role,
            Arc::new(SimulatedHandler {
                role,
                work: Duration::from_millis(work_ms),
                failures_left: AtomicU32::new(flaky),
            }),
        )?;
    }
    let runtime = Arc::new(Runtime::new(Arc::new(registry)));

    let worker_ids = (1..=workers)
        .map(|i| WorkerId::new(format!("worker-{i}")))
        .collect();
    let group = WorkerGroup::spawn(
        worker_ids,
        scheduler.clone(),
        runtime,
        options,
    )
    .await;
    let sweeper = SweeperLoop::spawn_configured(scheduler.clone());

    let execution_id = scheduler.submit_execution(objective).await?;
    info!(execution_id = %execution_id, workers = group.len(), "running objective");

    let status = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %execution_id, "interrupted; cancelling");
                scheduler.cancel_execution(execution_id).await?;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
        let status = scheduler.get_execution_status(execution_id).await?;
        if status.phase.is_terminal() {
            break status;
        }
    };

    group.shutdown_and_join().await;
    sweeper.shutdown_and_join().await;
    info!(execution_id = %execution_id, phase = ?status.phase, "execution finished");
    Ok(status)
}

fn plan(objective: &str) -> Result<()> {
    let roster: Vec<Capability> = ROLES.iter().map(|&r| Capability::from(r)).collect();
    let decomposition = KeywordDecomposer::default().plan(objective, &roster)?;

    let ids = UlidGenerator::new(SystemClock);
    let graph = TaskGraph::construct(decomposition.clone(), &ids)?;

    let tasks = decomposition
        .tasks
        .iter()
        .enumerate()
        .map(|(i, spec)| PlannedTask {
            description: spec.description.clone(),
            required_capability: spec.required_capability.clone(),
            priority: spec.priority,
            depends_on: decomposition
                .edges
                .iter()
                .filter(|e| e.to == i)
                .map(|e| e.from)
                .collect(),
        })
        .collect();

    let output = PlanOutput {
        objective,
        tasks,
        plan: ExecutionPlan::of(&graph),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            objective,
            workers,
            work_ms,
            flaky,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let status = run(config, &objective, workers, work_ms, flaky).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Plan { objective } => plan(&objective)?,
    }
    Ok(())
}
