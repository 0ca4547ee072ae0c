//! Error types for foreman.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("VCS error: {0}")]
    Vcs(#[from] VcsError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors talking to the task API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("Failed to decode response from {path}: {reason}")]
    Decode { path: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Errors driving an external assistant process.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(
        "{provider} binary not found on PATH. Install the `{binary}` CLI or set FOREMAN_RUNNER_BINARY to its location"
    )]
    BinaryNotFound { provider: String, binary: String },

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Process exited with code {exit_code:?}: {diagnostic}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution aborted")]
    Aborted,

    #[error("A stream is already active on this runner")]
    Busy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Whether a fresh attempt might succeed.
    ///
    /// Only non-zero exits without a deliberate abort are transient; a
    /// missing binary, a timeout, or an abort are final for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed { .. })
    }
}

/// Session state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {session_id}: no transition from {from} on {event}")]
    InvalidTransition {
        session_id: String,
        from: String,
        event: String,
    },
}

/// Job execution errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type {job_type}")]
    NoHandler { job_type: String },

    #[error("Job {job_type} failed: {message}")]
    Handler { job_type: String, message: String },

    #[error("Job {job_type} exceeded watchdog timeout of {timeout:?}")]
    Timeout { job_type: String, timeout: Duration },

    #[error("Job API error: {0}")]
    Api(#[from] ApiError),

    #[error("Job configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Orchestrator is already running")]
    AlreadyRunning,

    #[error("Worker entrypoint not found. Build it with `cargo build --bin foreman-worker`. Searched: {}", format_paths(.searched))]
    EntrypointNotFound { searched: Vec<PathBuf> },

    #[error("Failed to spawn worker {agent_id}: {reason}")]
    Spawn { agent_id: String, reason: String },

    #[error("Agent {agent_id} not found")]
    AgentNotFound { agent_id: String },

    #[error("Task API error: {0}")]
    Api(#[from] ApiError),
}

/// Version-control and hosting CLI errors.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Hosting API rate limited: {detail}")]
    RateLimited { detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for foreman.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_execution_failures_are_retryable() {
        assert!(
            RunnerError::ExecutionFailed {
                exit_code: Some(1),
                diagnostic: "boom".to_string(),
            }
            .is_retryable()
        );
        assert!(!RunnerError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RunnerError::Aborted.is_retryable());
        assert!(
            !RunnerError::BinaryNotFound {
                provider: "claude".to_string(),
                binary: "claude".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn entrypoint_error_lists_searched_paths() {
        let err = OrchestratorError::EntrypointNotFound {
            searched: vec![PathBuf::from("/a/foreman-worker"), PathBuf::from("/b/foreman-worker")],
        };
        let msg = err.to_string();
        assert!(msg.contains("/a/foreman-worker, /b/foreman-worker"));
        assert!(msg.contains("cargo build"));
    }
}
