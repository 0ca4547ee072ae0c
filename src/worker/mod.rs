//! Worker process: claim tasks one at a time and drive the assistant on
//! each until the workspace has nothing left.
//!
//! - `args`: the `foreman-worker` command line
//! - `prompt`: turns a task into an execution prompt
//! - `report`: `@@foreman` lines read back by the orchestrator

pub mod args;
pub mod prompt;
pub mod report;

pub use args::WorkerArgs;
pub use prompt::build_prompt;
pub use report::{REPORT_PREFIX, WorkerReport};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::{Task, TaskApi, TaskUpdate};
use crate::dispatch::{DispatchScope, Dispatcher};
use crate::error::{OrchestratorError, VcsError};
use crate::events::{AgentEvent, EventEmitter, log_agent_event};
use crate::orchestrator::agent::{AgentState, new_agent_table};
use crate::runner::{CliRunner, Runner, RunnerConfig};
use crate::vcs::{GhClient, GitRepo, branch_name, push_branch, worktree_path};

/// Default spacing of heartbeat reports while a task runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Longest assistant result kept in the completion comment.
const MAX_SUMMARY_CHARS: usize = 4000;

/// Where reports go. The orchestrator reads stdout; tests collect them.
#[derive(Debug, Clone, Default)]
pub enum ReportSink {
    #[default]
    Stdout,
    Memory(Arc<Mutex<Vec<WorkerReport>>>),
}

impl ReportSink {
    fn send(&self, report: WorkerReport) {
        match self {
            Self::Stdout => report.emit(),
            Self::Memory(reports) => {
                if let Ok(mut reports) = reports.lock() {
                    reports.push(report);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub agent_id: String,
    pub project_path: PathBuf,
    pub base_branch: Option<String>,
    pub worktree_isolation: bool,
    pub auto_push: bool,
    pub heartbeat_interval: Duration,
}

impl WorkerSettings {
    pub fn new(agent_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: agent_id.into(),
            project_path: project_path.into(),
            base_branch: None,
            worktree_isolation: false,
            auto_push: false,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Counts for one worker lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u32,
    pub failed: u32,
}

/// Where a task's run happens.
struct Checkout {
    cwd: PathBuf,
    branch: Option<String>,
}

pub struct Worker {
    settings: WorkerSettings,
    dispatcher: Dispatcher,
    runner_config: RunnerConfig,
    reports: ReportSink,
    events: EventEmitter<AgentEvent>,
}

impl Worker {
    pub fn new(
        api: Arc<dyn TaskApi>,
        scope: DispatchScope,
        settings: WorkerSettings,
        runner_config: RunnerConfig,
    ) -> Self {
        let agents = new_agent_table();
        let dispatcher = Dispatcher::new(api, scope, agents).with_author(settings.agent_id.clone());
        Self {
            settings,
            dispatcher,
            runner_config,
            reports: ReportSink::default(),
            events: EventEmitter::new(),
        }
    }

    pub fn with_report_sink(mut self, sink: ReportSink) -> Self {
        self.reports = sink;
        self
    }

    /// Session events of every run this worker starts.
    pub fn events(&self) -> &EventEmitter<AgentEvent> {
        &self.events
    }

    /// Work until no task is available, then report idle.
    pub async fn run(&self) -> Result<WorkerSummary, OrchestratorError> {
        let agent_id = self.settings.agent_id.clone();
        self.dispatcher
            .agents()
            .write()
            .await
            .insert(agent_id.clone(), AgentState::new(&agent_id));
        tracing::info!(
            agent_id = %agent_id,
            workspace_id = %self.dispatcher.scope().workspace_id,
            sprint_id = self.dispatcher.scope().sprint_id.as_deref().unwrap_or("none"),
            "Worker started"
        );

        let mut summary = WorkerSummary::default();
        while let Some(task) = self.dispatcher.assign_task_to_agent(&agent_id).await? {
            if self.work_on(&task).await {
                summary.completed += 1;
            } else {
                summary.failed += 1;
            }
        }

        self.reports.send(WorkerReport::Idle);
        tracing::info!(
            agent_id = %agent_id,
            completed = summary.completed,
            failed = summary.failed,
            "No tasks left, worker exiting"
        );
        Ok(summary)
    }

    /// Run one claimed task to completion or failure. Returns whether it
    /// completed.
    async fn work_on(&self, task: &Task) -> bool {
        let agent_id = &self.settings.agent_id;
        self.reports.send(WorkerReport::TaskStarted {
            task_id: task.id.clone(),
            title: task.title.clone(),
        });

        let checkout = match self.prepare_checkout(task).await {
            Ok(checkout) => checkout,
            Err(e) => {
                let error = format!("Failed to prepare checkout: {e}");
                self.fail(task, &error).await;
                return false;
            }
        };

        let prompt = build_prompt(task, checkout.branch.as_deref(), &checkout.cwd);
        let runner = CliRunner::new(self.runner_config.clone(), &checkout.cwd).with_emitter(self.events.clone());
        let stop_output = CancellationToken::new();
        let output = spawn_output_forwarder(
            self.events.subscribe(),
            stop_output.clone(),
            matches!(self.reports, ReportSink::Stdout),
        );

        let result = {
            let run = runner.run(&prompt);
            tokio::pin!(run);
            let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = heartbeat.tick() => self.reports.send(WorkerReport::Heartbeat),
                }
            }
        };
        // The last events of the run are already queued; let them through.
        stop_output.cancel();
        if let Ok(forwarded) = output.await {
            tracing::debug!(task_id = %task.id, events = forwarded, "Session output forwarded");
        }

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.fail(task, &e.to_string()).await;
                return false;
            }
        };

        let pr_url = match (&checkout.branch, self.settings.auto_push) {
            (Some(branch), true) => self.publish(task, branch, &checkout.cwd).await,
            _ => None,
        };
        let mut comment = truncate_chars(output.trim(), MAX_SUMMARY_CHARS);
        if let Some(url) = &pr_url {
            comment.push_str(&format!("\n\nPull request: {url}"));
        }

        match self
            .dispatcher
            .complete_task(&task.id, agent_id, Some(&comment))
            .await
        {
            Ok(()) => {
                self.reports.send(WorkerReport::TaskCompleted {
                    task_id: task.id.clone(),
                    pr_url,
                });
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to record completion");
                self.reports.send(WorkerReport::TaskFailed {
                    task_id: task.id.clone(),
                    error: format!("Failed to record completion: {e}"),
                });
                false
            }
        }
    }

    async fn fail(&self, task: &Task, error: &str) {
        self.dispatcher
            .fail_task(&task.id, &self.settings.agent_id, error)
            .await;
        self.reports.send(WorkerReport::TaskFailed {
            task_id: task.id.clone(),
            error: error.to_string(),
        });
    }

    /// The project itself, or a branch worktree when isolation is on.
    async fn prepare_checkout(&self, task: &Task) -> Result<Checkout, VcsError> {
        if !self.settings.worktree_isolation {
            return Ok(Checkout {
                cwd: self.settings.project_path.clone(),
                branch: None,
            });
        }

        let branch = task
            .branch
            .clone()
            .unwrap_or_else(|| branch_name(&task.id, &task.title));
        let repo = GitRepo::open(&self.settings.project_path)?;
        repo.ensure_branch(&branch, self.settings.base_branch.as_deref())?;
        let cwd = repo.ensure_worktree(&branch, &worktree_path(&self.settings.project_path, &branch))?;

        if task.branch.as_deref() != Some(branch.as_str()) {
            let update = TaskUpdate::default().with_branch(branch.clone());
            if let Err(e) = self.dispatcher.api().update_task(&task.id, &update).await {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to record task branch");
            }
        }
        Ok(Checkout {
            cwd,
            branch: Some(branch),
        })
    }

    /// Push the branch and open a PR. Failures are logged and leave the
    /// task completed without a PR.
    async fn publish(&self, task: &Task, branch: &str, cwd: &Path) -> Option<String> {
        if let Err(e) = push_branch(cwd, branch).await {
            tracing::warn!(task_id = %task.id, branch = %branch, error = %e, "Push failed");
            return None;
        }
        let title = format!("{} ({})", task.title.trim(), task.id);
        let body = format!("Automated change for task {}.", task.id);
        match GhClient::new(cwd)
            .create_pr(branch, self.settings.base_branch.as_deref(), &title, &body)
            .await
        {
            Ok(url) => {
                tracing::info!(task_id = %task.id, pr_url = %url, "Opened pull request");
                Some(url)
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, branch = %branch, error = %e, "Failed to open pull request");
                None
            }
        }
    }
}

/// Log session events and, with `echo`, print assistant text to stdout so
/// the orchestrator can forward it. After `stop` fires, events already
/// queued are still handled. Returns the number of events handled.
fn spawn_output_forwarder(
    mut rx: broadcast::Receiver<AgentEvent>,
    stop: CancellationToken,
    echo: bool,
) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut handled = 0;
        loop {
            let event = tokio::select! {
                biased;
                event = rx.recv() => event,
                _ = stop.cancelled() => break,
            };
            match event {
                Ok(event) => {
                    forward_event(&event, echo);
                    handled += 1;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Output forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return handled,
            }
        }
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    forward_event(&event, echo);
                    handled += 1;
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Output forwarder lagged");
                }
                Err(_) => break,
            }
        }
        handled
    })
}

fn forward_event(event: &AgentEvent, echo: bool) {
    log_agent_event(event);
    if let (true, AgentEvent::TextDelta { content, .. }) = (echo, event) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{content}");
        let _ = stdout.flush();
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{InMemoryTaskApi, Priority, TaskStatus};
    use crate::runner::RetryPolicy;

    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"Fixed it"}"#;

    fn fixture(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("output.jsonl");
        std::fs::write(&path, format!("{RESULT}\n")).unwrap();
        path
    }

    fn sh_config(script: &str) -> RunnerConfig {
        RunnerConfig::default()
            .with_binary("sh")
            .with_launcher_args(["-c", script])
            .with_retry(RetryPolicy::none())
    }

    fn worker(
        api: Arc<InMemoryTaskApi>,
        settings: WorkerSettings,
        config: RunnerConfig,
    ) -> (Worker, Arc<Mutex<Vec<WorkerReport>>>) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let worker = Worker::new(
            api,
            DispatchScope {
                workspace_id: "ws".to_string(),
                sprint_id: None,
            },
            settings,
            config,
        )
        .with_report_sink(ReportSink::Memory(reports.clone()));
        (worker, reports)
    }

    fn kinds(reports: &Mutex<Vec<WorkerReport>>) -> Vec<&'static str> {
        reports
            .lock()
            .unwrap()
            .iter()
            .map(|r| match r {
                WorkerReport::Heartbeat => "heartbeat",
                WorkerReport::TaskStarted { .. } => "started",
                WorkerReport::TaskCompleted { .. } => "completed",
                WorkerReport::TaskFailed { .. } => "failed",
                WorkerReport::Idle => "idle",
            })
            .filter(|k| *k != "heartbeat")
            .collect()
    }

    #[tokio::test]
    async fn forwarder_handles_events_queued_before_stop() {
        let events = EventEmitter::new();
        let stop = CancellationToken::new();
        let forwarder = spawn_output_forwarder(events.subscribe(), stop.clone(), false);

        let session_id = "s-1".to_string();
        events.emit(AgentEvent::TextDelta {
            session_id: session_id.clone(),
            content: "last words".to_string(),
        });
        events.emit(AgentEvent::ResponseCompleted {
            session_id: session_id.clone(),
            content: "last words".to_string(),
        });
        events.emit(AgentEvent::ThinkingStopped { session_id });
        stop.cancel();

        assert_eq!(forwarder.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn works_through_tasks_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(InMemoryTaskApi::with_tasks([
            Task::new("1", "ws", "Later").with_priority(Priority::Low),
            Task::new("2", "ws", "First").with_priority(Priority::Critical),
        ]));
        let script = format!("cat {}", fixture(&dir).display());
        let (worker, reports) = worker(
            api.clone(),
            WorkerSettings::new("agent-1", dir.path()),
            sh_config(&script),
        );

        let summary = worker.run().await.unwrap();
        assert_eq!(summary, WorkerSummary { completed: 2, failed: 0 });
        assert_eq!(
            kinds(&reports),
            ["started", "completed", "started", "completed", "idle"]
        );
        match &reports.lock().unwrap()[0] {
            WorkerReport::TaskStarted { task_id, .. } => assert_eq!(task_id, "2"),
            other => panic!("unexpected {other:?}"),
        }
        for id in ["1", "2"] {
            assert_eq!(api.task(id).unwrap().status, TaskStatus::NeedsVerification);
        }
        assert!(
            api.comments()
                .iter()
                .any(|c| c.task_id == "2" && c.body.contains("Fixed it"))
        );
    }

    #[tokio::test]
    async fn failed_run_returns_task_to_backlog_and_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(InMemoryTaskApi::with_tasks([Task::new("1", "ws", "Broken")]));
        let (worker, reports) = worker(
            api.clone(),
            WorkerSettings::new("agent-1", dir.path()),
            sh_config("echo 'model overloaded' >&2; exit 1"),
        );

        let summary = worker.run().await.unwrap();
        assert_eq!(summary, WorkerSummary { completed: 0, failed: 1 });
        assert_eq!(kinds(&reports), ["started", "failed", "idle"]);

        let task = api.task("1").unwrap();
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.assignee_id, None);
        assert!(
            api.comments()
                .iter()
                .any(|c| c.body.contains("model overloaded"))
        );
    }

    #[tokio::test]
    async fn empty_workspace_reports_idle_only() {
        let dir = tempfile::tempdir().unwrap();
        let (worker, reports) = worker(
            Arc::new(InMemoryTaskApi::new()),
            WorkerSettings::new("agent-1", dir.path()),
            sh_config("exit 0"),
        );
        assert_eq!(worker.run().await.unwrap(), WorkerSummary::default());
        assert_eq!(kinds(&reports), ["idle"]);
    }

    #[tokio::test]
    async fn isolation_runs_in_task_worktree() {
        use git2::{Repository, Signature};

        let repo_dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(repo_dir.path()).unwrap();
        std::fs::write(repo_dir.path().join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let cwd_file = scratch.path().join("cwd.txt");
        let script = format!(
            "pwd > {}; cat {}",
            cwd_file.display(),
            fixture(&scratch).display()
        );
        let api = Arc::new(InMemoryTaskApi::with_tasks([Task::new("1", "ws", "Fix login")]));
        let mut settings = WorkerSettings::new("agent-1", repo_dir.path());
        settings.worktree_isolation = true;
        let (worker, _reports) = worker(api.clone(), settings, sh_config(&script));

        assert_eq!(worker.run().await.unwrap().completed, 1);
        let cwd = std::fs::read_to_string(&cwd_file).unwrap();
        assert!(cwd.trim().ends_with(".foreman/worktrees/task-1-fix-login"));
        assert_eq!(api.task("1").unwrap().branch.as_deref(), Some("task/1-fix-login"));
        assert!(GitRepo::open(repo_dir.path()).unwrap().branch_exists("task/1-fix-login").unwrap());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé…");
    }
}
