//! Runners drive one external coding-assistant process per invocation.
//!
//! Supports:
//! - **Claude**: `claude -p <prompt> --output-format stream-json --verbose`
//! - **Codex**: `codex exec --json <prompt>`
//!
//! Whatever the backend, callers see the same [`StreamChunk`] sequence and
//! the same [`AgentEvent`](crate::events::AgentEvent) stream.

pub mod cli;
pub mod parser;
pub mod retry;
pub mod stream;

pub use cli::CliRunner;
pub use parser::{ClaudeParser, CodexParser, OutputParser, ParsedItem};
pub use retry::RetryPolicy;
pub use stream::{ChunkStream, ExitInfo};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RunnerError;

/// Default execution ceiling (1 hour).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

/// One typed fragment of a streamed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    TextDelta { content: String },
    Thinking { content: String },
    ToolUse { tool: String, id: String },
    Result { content: String },
    Error { error: String },
}

/// Supported assistant backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Claude,
    Codex,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Executable looked up on PATH when no binary is configured.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    pub fn parser(&self) -> Box<dyn OutputParser> {
        match self {
            Self::Claude => Box::new(ClaudeParser),
            Self::Codex => Box::new(CodexParser),
        }
    }

    /// Provider arguments for one headless invocation.
    pub fn args(&self, prompt: &str, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = match self {
            Self::Claude => vec![
                "-p".into(),
                prompt.into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
                "--dangerously-skip-permissions".into(),
            ],
            Self::Codex => vec![
                "exec".into(),
                "--json".into(),
                "--full-auto".into(),
                "--skip-git-repo-check".into(),
            ],
        };
        if let Some(model) = model {
            match self {
                Self::Claude => args.extend(["--model".to_string(), model.to_string()]),
                Self::Codex => args.extend(["-m".to_string(), model.to_string()]),
            }
        }
        if *self == Self::Codex {
            args.push(prompt.to_string());
        }
        args
    }

    /// Parse a provider name, falling back to the primary provider.
    pub fn from_str_lossy(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| {
            tracing::warn!(provider = %s, "Unknown provider, using claude");
            Self::Claude
        })
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" | "anthropic" => Ok(Self::Claude),
            "codex" | "openai" => Ok(Self::Codex),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub provider: Provider,
    /// Executable to launch. Looked up on PATH when `None`.
    pub binary: Option<PathBuf>,
    /// Arguments placed before the provider arguments (e.g. a wrapper
    /// script's own arguments).
    pub launcher_args: Vec<String>,
    /// Arguments appended after the provider arguments.
    pub extra_args: Vec<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            binary: None,
            launcher_args: Vec::new(),
            extra_args: Vec::new(),
            model: None,
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            ..Self::default()
        }
    }

    /// Read overrides from the environment.
    ///
    /// `FOREMAN_RUNNER_BINARY`, `FOREMAN_RUNNER_TIMEOUT_SECS`,
    /// `FOREMAN_RUNNER_MAX_ATTEMPTS`.
    pub fn from_env(provider: Provider, model: Option<String>) -> Self {
        let binary = std::env::var("FOREMAN_RUNNER_BINARY").ok().map(PathBuf::from);
        let timeout = std::env::var("FOREMAN_RUNNER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        let max_attempts = std::env::var("FOREMAN_RUNNER_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(retry::DEFAULT_MAX_ATTEMPTS)
            .max(1);
        Self {
            provider,
            binary,
            model,
            timeout,
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    pub fn with_launcher_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launcher_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Driver for an external assistant.
#[async_trait]
pub trait Runner: Send + Sync {
    fn provider(&self) -> Provider;

    /// Run to completion and return the final text. Transient failures are
    /// retried; timeouts and aborts are not.
    async fn run(&self, prompt: &str) -> Result<String, RunnerError>;

    /// Launch once and stream chunks as output arrives.
    async fn run_stream(&self, prompt: &str) -> Result<ChunkStream, RunnerError>;

    /// Signal the active process to stop. Returns `false` if there was
    /// nothing to stop or it was already signalled.
    fn abort(&self) -> bool;
}
