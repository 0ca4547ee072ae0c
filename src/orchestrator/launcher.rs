//! Building the worker command line.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;

use crate::runner::Provider;

/// Everything a worker needs to know, passed on its command line.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub agent_id: String,
    pub workspace_id: String,
    pub sprint_id: Option<String>,
    pub api_url: String,
    pub api_key: SecretString,
    pub project_path: PathBuf,
    pub model: Option<String>,
    pub provider: Provider,
    pub base_branch: Option<String>,
    pub worktree_isolation: bool,
    pub auto_push: bool,
}

impl WorkerParams {
    /// Worker flags. The API key is not among them: it travels in the
    /// environment so it does not show up in process listings.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--agent-id".to_string(),
            self.agent_id.clone(),
            "--workspace-id".to_string(),
            self.workspace_id.clone(),
            "--api-url".to_string(),
            self.api_url.clone(),
            "--project-path".to_string(),
            self.project_path.display().to_string(),
            "--provider".to_string(),
            self.provider.to_string(),
        ];
        if let Some(sprint_id) = &self.sprint_id {
            args.extend(["--sprint-id".to_string(), sprint_id.clone()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(base) = &self.base_branch {
            args.extend(["--base-branch".to_string(), base.clone()]);
        }
        if self.worktree_isolation {
            args.push("--worktree-isolation".to_string());
        }
        if self.auto_push {
            args.push("--auto-push".to_string());
        }
        args
    }
}

/// Builds the process for one agent. The orchestrator sets up stdio.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, params: &WorkerParams) -> Command;
}

/// Launches the `foreman-worker` binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    entrypoint: PathBuf,
}

impl ProcessLauncher {
    pub fn new(entrypoint: impl Into<PathBuf>) -> Self {
        Self {
            entrypoint: entrypoint.into(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn command(&self, params: &WorkerParams) -> Command {
        let mut command = Command::new(&self.entrypoint);
        command
            .args(params.args())
            .env("FOREMAN_API_KEY", params.api_key.expose_secret())
            .current_dir(&params.project_path);
        command
    }
}
