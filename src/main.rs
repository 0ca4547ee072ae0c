use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use foreman::api::{HttpTaskApi, InMemoryTaskApi, TaskApi};
use foreman::config::{OrchestratorConfig, SchedulerConfig};
use foreman::jobs::{
    FileConfigSource, JobConfigSource, JobRegistry, JobRunner, JobScheduler, LintJob, SchedulerEvent,
};
use foreman::orchestrator::{Orchestrator, OrchestratorEvent, ProcessLauncher, entrypoint};
use foreman::runner::{Provider, RunnerConfig};

/// foreman - run coding assistants against a task board
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    FOREMAN_WORKSPACE_ID, FOREMAN_API_URL, FOREMAN_API_KEY are required except for --dry-run.\n    RUST_LOG controls log verbosity (default: info)."
)]
struct Cli {
    /// Also write logs to daily files in this directory
    #[arg(long, env = "FOREMAN_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Spawn workers until the board has no available work
    Orchestrate {
        /// Upper bound on concurrent workers
        #[arg(long)]
        max_agents: Option<usize>,

        /// Work on this sprint instead of the active one
        #[arg(long)]
        sprint_id: Option<String>,
    },

    /// Run scheduled jobs until Ctrl-C
    Schedule {
        /// Job configuration file
        #[arg(long, env = "FOREMAN_JOBS_CONFIG", default_value = "foreman-jobs.json")]
        config: PathBuf,

        /// Reload when the configuration file changes, checking every N seconds
        #[arg(long)]
        reload_interval: Option<u64>,
    },

    /// Run one job immediately
    RunJob {
        job_type: String,

        /// Job configuration file
        #[arg(long, env = "FOREMAN_JOBS_CONFIG", default_value = "foreman-jobs.json")]
        config: PathBuf,

        /// Record runs and suggestions in memory instead of the task API
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = foreman::logging::init_with_file(cli.log_dir.as_deref(), "foreman.log");

    match cli.command {
        Command::Orchestrate {
            max_agents,
            sprint_id,
        } => orchestrate(max_agents, sprint_id).await,
        Command::Schedule {
            config,
            reload_interval,
        } => schedule(&config, reload_interval.map(Duration::from_secs)).await,
        Command::RunJob {
            job_type,
            config,
            dry_run,
        } => run_job(&job_type, &config, dry_run).await,
    }
}

async fn orchestrate(max_agents: Option<usize>, sprint_id: Option<String>) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(max) = max_agents {
        config.max_agents = max.max(1);
    }
    if sprint_id.is_some() {
        config.sprint_id = sprint_id;
    }

    let worker = entrypoint::resolve(config.worker_entrypoint.as_deref())?;
    tracing::info!(entrypoint = %worker.display(), "Using worker binary");
    let api: Arc<dyn TaskApi> = Arc::new(HttpTaskApi::new(&config.api_url, config.api_key.clone())?);
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        api,
        Arc::new(ProcessLauncher::new(worker)),
    ));

    let mut events = orchestrator.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            narrate(&event);
        }
    });

    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop().await;
        }
    });

    let summary = orchestrator.start().await?;
    eprintln!(
        "Done: {} worker(s), {} task(s) completed, {} failed",
        summary.agents_spawned, summary.tasks_completed, summary.tasks_failed
    );
    Ok(())
}

/// One stderr line per orchestrator event that is worth a human's attention.
fn narrate(event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::Started {
            available_tasks,
            agents,
            ..
        } => eprintln!("{available_tasks} task(s) available, starting {agents} worker(s)"),
        OrchestratorEvent::NoWork { workspace_id } => {
            eprintln!("No available tasks in workspace {workspace_id}")
        }
        OrchestratorEvent::AgentSpawned { agent_id, pid } => {
            eprintln!("{agent_id} spawned (pid {})", pid.map_or("?".to_string(), |p| p.to_string()))
        }
        OrchestratorEvent::TaskStarted { agent_id, task_id } => eprintln!("{agent_id} started task {task_id}"),
        OrchestratorEvent::TaskCompleted { agent_id, task_id } => {
            eprintln!("{agent_id} completed task {task_id}")
        }
        OrchestratorEvent::TaskFailed {
            agent_id,
            task_id,
            error,
        } => eprintln!("{agent_id} failed task {task_id}: {error}"),
        OrchestratorEvent::AgentCompleted {
            agent_id,
            completed,
            failed,
            ..
        } => eprintln!("{agent_id} finished ({completed} completed, {failed} failed)"),
        OrchestratorEvent::AgentFailed {
            agent_id, error, ..
        } => eprintln!("{agent_id} exited abnormally: {error}"),
        OrchestratorEvent::Stopped { agents_killed } => eprintln!("Stopping, killed {agents_killed} worker(s)"),
        OrchestratorEvent::AgentOutput { .. } => {}
    }
}

/// Task API, workspace and project a job runner works against.
fn job_environment(dry_run: bool) -> anyhow::Result<(Arc<dyn TaskApi>, String, PathBuf)> {
    let project_path = std::env::var("FOREMAN_PROJECT_PATH")
        .map(PathBuf::from)
        .or_else(|_| std::env::current_dir())
        .context("cannot determine project path")?;
    if dry_run {
        let workspace_id = std::env::var("FOREMAN_WORKSPACE_ID").unwrap_or_else(|_| "dry-run".to_string());
        return Ok((Arc::new(InMemoryTaskApi::new()), workspace_id, project_path));
    }
    let config = OrchestratorConfig::from_env()?;
    let api: Arc<dyn TaskApi> = Arc::new(HttpTaskApi::new(&config.api_url, config.api_key.clone())?);
    Ok((api, config.workspace_id, project_path))
}

fn registry() -> JobRegistry {
    let provider = std::env::var("FOREMAN_PROVIDER")
        .map(|p| Provider::from_str_lossy(&p))
        .unwrap_or_default();
    let model = std::env::var("FOREMAN_MODEL").ok();
    let mut registry = JobRegistry::new();
    registry.register(Arc::new(LintJob::new(RunnerConfig::from_env(provider, model))));
    registry
}

async fn schedule(config_path: &Path, reload_interval: Option<Duration>) -> anyhow::Result<()> {
    let (api, workspace_id, project_path) = job_environment(false)?;
    let source = Arc::new(FileConfigSource::new(config_path));
    let runner = JobRunner::new(api, Arc::new(registry()), workspace_id, project_path);
    let scheduler = JobScheduler::new(source.clone(), runner, SchedulerConfig::from_env()?);

    let mut events = scheduler.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SchedulerEvent::Skipped { job_type, reason } => eprintln!("Skipped {job_type}: {reason}"),
                SchedulerEvent::JobCompleted { job_type, summary } => eprintln!("{job_type}: {summary}"),
                SchedulerEvent::JobFailed { job_type, error } => eprintln!("{job_type} failed: {error}"),
                _ => {}
            }
        }
    });

    let count = scheduler
        .start()
        .await
        .with_context(|| format!("loading {}", config_path.display()))?;
    eprintln!("Scheduled {count} job(s) from {}. Ctrl-C to stop.", config_path.display());

    match reload_interval {
        Some(interval) => {
            let mut last_modified = source.modified();
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = ticker.tick() => {
                        let modified = source.modified();
                        if modified != last_modified {
                            last_modified = modified;
                            if let Err(e) = scheduler.reload().await {
                                eprintln!("Reload of {} failed, keeping current schedule: {e}", config_path.display());
                            }
                        }
                    }
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    scheduler.stop().await;
    Ok(())
}

async fn run_job(job_type: &str, config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let (api, workspace_id, project_path) = job_environment(dry_run)?;
    let source = FileConfigSource::new(config_path);
    let settings = if config_path.exists() {
        source.load().await?
    } else {
        tracing::info!(path = %config_path.display(), "No job configuration file, using defaults");
        Default::default()
    };
    let config = settings.jobs.get(job_type).cloned().unwrap_or_default();

    let runner = JobRunner::new(api.clone(), Arc::new(registry()), workspace_id, project_path)
        .with_timeout(SchedulerConfig::from_env()?.job_timeout);
    let result = runner.run_job(job_type, &config, &settings.autonomy).await?;

    println!("{}", result.summary);
    for suggestion in &result.suggestions {
        let location = suggestion.file_path.as_deref().unwrap_or("-");
        let severity = suggestion.severity.unwrap_or(config.severity);
        println!("  [{severity:?}] {location}: {}", suggestion.title);
    }
    Ok(())
}
