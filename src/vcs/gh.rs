//! Thin wrapper around the GitHub CLI.
//!
//! Every call goes through [`GhClient::call`], which spaces calls out,
//! logs each one with its duration, and turns rate-limit responses into
//! [`VcsError::RateLimited`] instead of retrying.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::VcsError;

/// Minimum spacing between two hosting calls.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api rate limit exceeded|secondary rate limit|abuse detection|HTTP 429|too many requests)")
        .unwrap()
});

pub fn is_rate_limited(stderr: &str) -> bool {
    RATE_LIMIT.is_match(stderr)
}

/// Review verdicts accepted by `gh pr review`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewEvent {
    fn flag(&self) -> &'static str {
        match self {
            Self::Approve => "--approve",
            Self::RequestChanges => "--request-changes",
            Self::Comment => "--comment",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub head_ref_name: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Milestone {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: String,
}

pub struct GhClient {
    program: PathBuf,
    cwd: PathBuf,
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl GhClient {
    /// Client running `gh` in `cwd` (the repository checkout).
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("gh"),
            cwd: cwd.into(),
            min_interval: DEFAULT_MIN_INTERVAL,
            last_call: Mutex::new(None),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `gh <args>` and return trimmed stdout.
    pub async fn call(&self, args: &[&str]) -> Result<String, VcsError> {
        self.throttle().await;
        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.cwd)
            .output()
            .await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let command = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let rate_limited = is_rate_limited(&stderr);
        if rate_limited {
            tracing::warn!(command = %command, elapsed_ms, stderr = %stderr, "Hosting API rate limited");
        }
        if !output.status.success() {
            if rate_limited {
                return Err(VcsError::RateLimited { detail: stderr });
            }
            tracing::warn!(command = %command, elapsed_ms, status = %output.status, "gh call failed");
            return Err(VcsError::Command {
                program: format!("gh {command}"),
                status: output.status.to_string(),
                stderr,
            });
        }
        tracing::info!(command = %command, elapsed_ms, "gh call");
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn call_json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T, VcsError> {
        let stdout = self.call(args).await?;
        serde_json::from_str(&stdout).map_err(|e| VcsError::Command {
            program: format!("gh {}", args.first().copied().unwrap_or_default()),
            status: "ok".to_string(),
            stderr: format!("unparseable output: {e}"),
        })
    }

    /// Returns the issue URL.
    pub async fn create_issue(&self, title: &str, body: &str, labels: &[&str]) -> Result<String, VcsError> {
        let labels = labels.join(",");
        let mut args = vec!["issue", "create", "--title", title, "--body", body];
        if !labels.is_empty() {
            args.extend(["--label", &labels]);
        }
        self.call(&args).await
    }

    /// Returns the PR URL.
    pub async fn create_pr(
        &self,
        head: &str,
        base: Option<&str>,
        title: &str,
        body: &str,
    ) -> Result<String, VcsError> {
        let mut args = vec!["pr", "create", "--head", head, "--title", title, "--body", body];
        if let Some(base) = base {
            args.extend(["--base", base]);
        }
        self.call(&args).await
    }

    pub async fn list_prs(&self, state: &str) -> Result<Vec<PullRequest>, VcsError> {
        self.call_json(&[
            "pr",
            "list",
            "--state",
            state,
            "--json",
            "number,title,url,headRefName,state",
        ])
        .await
    }

    pub async fn edit_labels(&self, number: u64, add: &[&str], remove: &[&str]) -> Result<(), VcsError> {
        let number = number.to_string();
        let add = add.join(",");
        let remove = remove.join(",");
        let mut args = vec!["issue", "edit", number.as_str()];
        if !add.is_empty() {
            args.extend(["--add-label", &add]);
        }
        if !remove.is_empty() {
            args.extend(["--remove-label", &remove]);
        }
        self.call(&args).await.map(|_| ())
    }

    pub async fn pr_diff(&self, number: u64) -> Result<String, VcsError> {
        let number = number.to_string();
        self.call(&["pr", "diff", &number]).await
    }

    pub async fn submit_review(&self, number: u64, event: ReviewEvent, body: &str) -> Result<(), VcsError> {
        let number = number.to_string();
        self.call(&["pr", "review", &number, event.flag(), "--body", body])
            .await
            .map(|_| ())
    }

    pub async fn create_milestone(&self, title: &str, description: &str) -> Result<Milestone, VcsError> {
        let title = format!("title={title}");
        let description = format!("description={description}");
        self.call_json(&[
            "api",
            "repos/{owner}/{repo}/milestones",
            "--method",
            "POST",
            "-f",
            &title,
            "-f",
            &description,
        ])
        .await
    }

    pub async fn list_milestones(&self) -> Result<Vec<Milestone>, VcsError> {
        self.call_json(&["api", "repos/{owner}/{repo}/milestones?state=all"])
            .await
    }

    pub async fn delete_milestone(&self, number: u64) -> Result<(), VcsError> {
        let path = format!("repos/{{owner}}/{{repo}}/milestones/{number}");
        self.call(&["api", &path, "--method", "DELETE"]).await.map(|_| ())
    }
}
