//! Configuration types.
//!
//! Runner settings live with the runner ([`RunnerConfig`](crate::runner::RunnerConfig)).

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::runner::Provider;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub workspace_id: String,
    /// Restrict to one sprint. Resolved to the active sprint when `None`.
    pub sprint_id: Option<String>,
    pub api_url: String,
    pub api_key: SecretString,
    pub project_path: PathBuf,
    pub model: Option<String>,
    pub provider: Provider,
    /// Branch new task branches start from. HEAD when `None`.
    pub base_branch: Option<String>,
    /// Give each task its own git worktree.
    pub worktree_isolation: bool,
    /// Push task branches and open a PR after a successful run.
    pub auto_push: bool,
    /// Upper bound on concurrent workers.
    pub max_agents: usize,
    /// Delay between liveness checks.
    pub poll_interval: Duration,
    /// Worker binary. Searched for next to the current executable when `None`.
    pub worker_entrypoint: Option<PathBuf>,
}

impl OrchestratorConfig {
    pub fn new(
        workspace_id: impl Into<String>,
        api_url: impl Into<String>,
        api_key: SecretString,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            sprint_id: None,
            api_url: api_url.into(),
            api_key,
            project_path: project_path.into(),
            model: None,
            provider: Provider::default(),
            base_branch: None,
            worktree_isolation: false,
            auto_push: false,
            max_agents: 1,
            poll_interval: Duration::from_secs(2),
            worker_entrypoint: None,
        }
    }

    /// Load from `FOREMAN_*` environment variables.
    ///
    /// Requires `FOREMAN_WORKSPACE_ID`, `FOREMAN_API_URL` and
    /// `FOREMAN_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_id = required("FOREMAN_WORKSPACE_ID", "Set it to the workspace to work on")?;
        let api_url = required("FOREMAN_API_URL", "Set it to the task API base URL")?;
        let api_key = required("FOREMAN_API_KEY", "Create an API key in the dashboard")?;
        let project_path = std::env::var("FOREMAN_PROJECT_PATH")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())?;

        let mut config = Self::new(workspace_id, api_url, SecretString::from(api_key), project_path);
        config.sprint_id = optional("FOREMAN_SPRINT_ID");
        config.model = optional("FOREMAN_MODEL");
        config.provider = optional("FOREMAN_PROVIDER")
            .map(|p| Provider::from_str_lossy(&p))
            .unwrap_or_default();
        config.base_branch = optional("FOREMAN_BASE_BRANCH");
        config.worktree_isolation = flag("FOREMAN_WORKTREE_ISOLATION")?;
        config.auto_push = flag("FOREMAN_AUTO_PUSH")?;
        if let Some(max) = parsed::<usize>("FOREMAN_MAX_AGENTS")? {
            config.max_agents = max.max(1);
        }
        if let Some(secs) = parsed::<u64>("FOREMAN_POLL_INTERVAL_SECS")? {
            config.poll_interval = Duration::from_secs(secs.max(1));
        }
        config.worker_entrypoint = optional("FOREMAN_WORKER_BIN").map(PathBuf::from);
        Ok(config)
    }
}

/// Job scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Watchdog for a single job run. Off when `None`.
    pub job_timeout: Option<Duration>,
}

impl SchedulerConfig {
    /// `FOREMAN_JOB_TIMEOUT_SECS` (0 or unset disables the watchdog).
    pub fn from_env() -> Result<Self, ConfigError> {
        let job_timeout = parsed::<u64>("FOREMAN_JOB_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Ok(Self { job_timeout })
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn required(key: &str, hint: &str) -> Result<String, ConfigError> {
    optional(key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

fn parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional(key)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn flag(key: &str) -> Result<bool, ConfigError> {
    match optional(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {v:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_defaults() {
        let config = OrchestratorConfig::new(
            "ws",
            "http://localhost:3000",
            SecretString::from("key".to_string()),
            "/tmp/project",
        );
        assert_eq!(config.max_agents, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.provider, Provider::Claude);
        assert!(!config.worktree_isolation);
        assert!(!config.auto_push);
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = OrchestratorConfig::new(
            "ws",
            "http://localhost:3000",
            SecretString::from("super-secret-key".to_string()),
            "/tmp/project",
        );
        assert!(!format!("{config:?}").contains("super-secret-key"));
    }

    #[test]
    fn scheduler_watchdog_off_by_default() {
        assert_eq!(SchedulerConfig::default().job_timeout, None);
    }
}
