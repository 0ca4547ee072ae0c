use std::sync::Arc;

use clap::Parser;

use foreman::api::{HttpTaskApi, TaskApi};
use foreman::dispatch::DispatchScope;
use foreman::runner::RunnerConfig;
use foreman::worker::{Worker, WorkerArgs, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing flags exit non-zero with clap's message on stderr.
    let args = WorkerArgs::parse();
    // Stdout carries reports and assistant output; logs go to stderr.
    foreman::logging::init();

    let api: Arc<dyn TaskApi> = Arc::new(HttpTaskApi::new(&args.api_url, args.api_key())?);
    let scope = DispatchScope {
        workspace_id: args.workspace_id.clone(),
        sprint_id: args.sprint_id.clone(),
    };
    let mut settings = WorkerSettings::new(&args.agent_id, &args.project_path);
    settings.base_branch = args.base_branch.clone();
    settings.worktree_isolation = args.worktree_isolation;
    settings.auto_push = args.auto_push;

    let runner_config = RunnerConfig::from_env(args.provider, args.model.clone());
    let worker = Worker::new(api, scope, settings, runner_config);
    let summary = worker.run().await?;
    tracing::info!(
        agent_id = %args.agent_id,
        completed = summary.completed,
        failed = summary.failed,
        "Worker done"
    );
    Ok(())
}
