//! Command line of the `foreman-worker` binary.

use std::path::PathBuf;

use clap::Parser;
use secrecy::SecretString;

use crate::runner::Provider;

/// Run tasks from one workspace until none are left
#[derive(Parser, Debug, Clone)]
#[command(name = "foreman-worker")]
#[command(version, about, long_about = None)]
pub struct WorkerArgs {
    /// Identifier the orchestrator assigned to this worker
    #[arg(long)]
    pub agent_id: String,

    #[arg(long)]
    pub workspace_id: String,

    /// Restrict work to one sprint
    #[arg(long)]
    pub sprint_id: Option<String>,

    /// Base URL of the task API
    #[arg(long, visible_alias = "api-base")]
    pub api_url: String,

    #[arg(long, env = "FOREMAN_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Repository the assistant works in
    #[arg(long)]
    pub project_path: PathBuf,

    #[arg(long)]
    pub model: Option<String>,

    /// Assistant backend. A bare `--provider` means the default one
    #[arg(
        long,
        num_args = 0..=1,
        default_value = "claude",
        default_missing_value = "claude",
        value_parser = parse_provider
    )]
    pub provider: Provider,

    /// Branch new task branches start from (defaults to HEAD)
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Give each task its own branch and worktree
    #[arg(long)]
    pub worktree_isolation: bool,

    /// Push the task branch and open a PR after a successful run
    #[arg(long)]
    pub auto_push: bool,
}

fn parse_provider(value: &str) -> Result<Provider, String> {
    Ok(Provider::from_str_lossy(value))
}

impl WorkerArgs {
    pub fn api_key(&self) -> SecretString {
        SecretString::from(self.api_key.clone())
    }
}
