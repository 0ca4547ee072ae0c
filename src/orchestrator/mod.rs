//! Agent orchestrator.
//!
//! Discovers available work, runs one worker process per agent slot, and
//! reaps workers as they exit. Workers claim and report tasks themselves;
//! the orchestrator follows along through their `@@foreman` report lines.

pub mod agent;
pub mod entrypoint;
pub mod launcher;

pub use agent::{AgentSnapshot, AgentState, AgentStatus, AgentTable, new_agent_table};
pub use launcher::{ProcessLauncher, WorkerLauncher, WorkerParams};

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::TaskApi;
use crate::config::OrchestratorConfig;
use crate::dispatch::{DispatchScope, Dispatcher};
use crate::error::OrchestratorError;
use crate::events::EventEmitter;
use crate::worker::report::WorkerReport;

/// How long to keep reading a worker's stdout after it exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Orchestrator lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    Started {
        workspace_id: String,
        sprint_id: Option<String>,
        available_tasks: usize,
        agents: usize,
    },
    NoWork {
        workspace_id: String,
    },
    AgentSpawned {
        agent_id: String,
        pid: Option<u32>,
    },
    AgentOutput {
        agent_id: String,
        line: String,
    },
    TaskStarted {
        agent_id: String,
        task_id: String,
    },
    TaskCompleted {
        agent_id: String,
        task_id: String,
    },
    TaskFailed {
        agent_id: String,
        task_id: String,
        error: String,
    },
    AgentCompleted {
        agent_id: String,
        exit_code: Option<i32>,
        completed: u32,
        failed: u32,
    },
    AgentFailed {
        agent_id: String,
        exit_code: Option<i32>,
        completed: u32,
        failed: u32,
        error: String,
    },
    Stopped {
        agents_killed: usize,
    },
}

/// Totals for one `start` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub agents_spawned: usize,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
}

#[derive(Default)]
struct Totals {
    completed: AtomicU32,
    failed: AtomicU32,
}

/// Clears the running flag when `start` returns, however it returns.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What an exit watcher needs, shared by every agent.
#[derive(Clone)]
struct Shared {
    agents: AgentTable,
    events: EventEmitter<OrchestratorEvent>,
    dispatcher: Arc<Dispatcher>,
    totals: Arc<Totals>,
    forward_output: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shared: Shared,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        api: Arc<dyn TaskApi>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let agents = new_agent_table();
        let scope = DispatchScope {
            workspace_id: config.workspace_id.clone(),
            sprint_id: config.sprint_id.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(api, scope, agents.clone()));
        Self {
            config,
            launcher,
            shared: Shared {
                agents,
                events: EventEmitter::new(),
                dispatcher,
                totals: Arc::new(Totals::default()),
                forward_output: true,
            },
            running: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether worker output is echoed to this process's stdout.
    pub fn with_output_forwarding(mut self, forward: bool) -> Self {
        self.shared.forward_output = forward;
        self
    }

    pub fn events(&self) -> &EventEmitter<OrchestratorEvent> {
        &self.shared.events
    }

    pub fn agents(&self) -> &AgentTable {
        &self.shared.agents
    }

    /// Assign/complete/fail operations over this orchestrator's agents.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        let agents = self.shared.agents.read().await;
        let mut snapshots: Vec<_> = agents.values().map(AgentState::snapshot).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    fn shutdown_token(&self) -> CancellationToken {
        match self.shutdown.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run until every spawned worker has exited.
    pub async fn start(&self) -> Result<RunSummary, OrchestratorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let shutdown = CancellationToken::new();
        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = shutdown.clone();
        }

        let workspace_id = self.config.workspace_id.clone();
        let sprint_id = self.resolve_sprint().await;
        let api = self.shared.dispatcher.api();
        let tasks = api
            .list_available_tasks(&workspace_id, sprint_id.as_deref())
            .await?;

        if tasks.is_empty() {
            tracing::info!(workspace_id = %workspace_id, sprint_id = ?sprint_id, "No available tasks, nothing to do");
            self.shared.events.emit(OrchestratorEvent::NoWork { workspace_id });
            return Ok(RunSummary::default());
        }

        let slots = self.config.max_agents.max(1).min(tasks.len());
        tracing::info!(
            workspace_id = %workspace_id,
            sprint_id = ?sprint_id,
            available_tasks = tasks.len(),
            agents = slots,
            "Orchestrator started"
        );
        self.shared.events.emit(OrchestratorEvent::Started {
            workspace_id: workspace_id.clone(),
            sprint_id: sprint_id.clone(),
            available_tasks: tasks.len(),
            agents: slots,
        });

        let before = RunSummary {
            agents_spawned: 0,
            tasks_completed: self.shared.totals.completed.load(Ordering::SeqCst),
            tasks_failed: self.shared.totals.failed.load(Ordering::SeqCst),
        };

        let mut spawned = 0;
        let mut last_error = None;
        for _ in 0..slots {
            let agent_id = format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]);
            match self.spawn_agent(&agent_id, sprint_id.clone(), &shutdown).await {
                Ok(()) => spawned += 1,
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Failed to spawn worker");
                    last_error = Some(e);
                }
            }
        }
        if spawned == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let mut stopping = false;
        loop {
            if self.shared.agents.read().await.is_empty() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled(), if !stopping => {
                    stopping = true;
                    tracing::info!("Shutdown requested, waiting for workers to exit");
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        let summary = RunSummary {
            agents_spawned: spawned,
            tasks_completed: self.shared.totals.completed.load(Ordering::SeqCst) - before.tasks_completed,
            tasks_failed: self.shared.totals.failed.load(Ordering::SeqCst) - before.tasks_failed,
        };
        tracing::info!(
            agents = summary.agents_spawned,
            completed = summary.tasks_completed,
            failed = summary.tasks_failed,
            "Orchestrator finished"
        );
        Ok(summary)
    }

    /// Configured sprint, else the workspace's active sprint, else none
    /// (every task in the workspace).
    async fn resolve_sprint(&self) -> Option<String> {
        if let Some(sprint_id) = &self.config.sprint_id {
            return Some(sprint_id.clone());
        }
        let api = self.shared.dispatcher.api();
        match api.get_active_sprint(&self.config.workspace_id).await {
            Ok(Some(sprint)) => {
                tracing::info!(sprint_id = %sprint.id, sprint = %sprint.name, "Using active sprint");
                Some(sprint.id)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Could not resolve active sprint, using whole workspace");
                None
            }
        }
    }

    async fn spawn_agent(
        &self,
        agent_id: &str,
        sprint_id: Option<String>,
        shutdown: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let params = WorkerParams {
            agent_id: agent_id.to_string(),
            workspace_id: self.config.workspace_id.clone(),
            sprint_id,
            api_url: self.config.api_url.clone(),
            api_key: self.config.api_key.clone(),
            project_path: self.config.project_path.clone(),
            model: self.config.model.clone(),
            provider: self.config.provider,
            base_branch: self.config.base_branch.clone(),
            worktree_isolation: self.config.worktree_isolation,
            auto_push: self.config.auto_push,
        };

        let mut command = self.launcher.command(&params);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| OrchestratorError::Spawn {
            agent_id: agent_id.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = AgentState::new(agent_id);
        state.pid = child.id();
        state.kill = shutdown.child_token();
        let kill = state.kill.clone();
        let pid = state.pid;
        self.shared.agents.write().await.insert(agent_id.to_string(), state);

        tracing::info!(agent_id = %agent_id, pid = ?pid, "Worker spawned");
        self.shared.events.emit(OrchestratorEvent::AgentSpawned {
            agent_id: agent_id.to_string(),
            pid,
        });

        let output = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_output(self.shared.clone(), agent_id.to_string(), stdout)));
        tokio::spawn(watch_exit(self.shared.clone(), agent_id.to_string(), child, kill, output));
        Ok(())
    }

    /// Kill every running worker. Safe to call repeatedly; returns the
    /// number of workers signalled by this call.
    pub async fn stop(&self) -> usize {
        let token = self.shutdown_token();
        if token.is_cancelled() {
            return 0;
        }
        let killed = self
            .shared
            .agents
            .read()
            .await
            .values()
            .filter(|a| !a.kill.is_cancelled())
            .count();
        token.cancel();
        tracing::info!(agents = killed, "Orchestrator stopping");
        self.shared.events.emit(OrchestratorEvent::Stopped { agents_killed: killed });
        killed
    }
}

async fn forward_output(shared: Shared, agent_id: String, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(agent_id = %agent_id, error = %e, "Worker stdout closed");
                break;
            }
        };
        if shared.forward_output {
            println!("{line}");
        }
        if let Some(report) = WorkerReport::parse_line(&line) {
            apply_report(&shared, &agent_id, report).await;
        }
        shared.events.emit(OrchestratorEvent::AgentOutput {
            agent_id: agent_id.clone(),
            line,
        });
    }
}

async fn apply_report(shared: &Shared, agent_id: &str, report: WorkerReport) {
    let mut agents = shared.agents.write().await;
    let Some(agent) = agents.get_mut(agent_id) else {
        return;
    };
    match report {
        WorkerReport::Heartbeat => agent.heartbeat(),
        WorkerReport::Idle => agent.set_idle(),
        WorkerReport::TaskStarted { task_id, title } => {
            tracing::info!(agent_id = %agent_id, task_id = %task_id, title = %title, "Agent started task");
            agent.start_task(&task_id);
            shared.events.emit(OrchestratorEvent::TaskStarted {
                agent_id: agent_id.to_string(),
                task_id,
            });
        }
        WorkerReport::TaskCompleted { task_id, pr_url } => {
            tracing::info!(agent_id = %agent_id, task_id = %task_id, pr_url = ?pr_url, "Agent completed task");
            agent.finish_task(true);
            shared.totals.completed.fetch_add(1, Ordering::SeqCst);
            shared.events.emit(OrchestratorEvent::TaskCompleted {
                agent_id: agent_id.to_string(),
                task_id,
            });
        }
        WorkerReport::TaskFailed { task_id, error } => {
            tracing::warn!(agent_id = %agent_id, task_id = %task_id, error = %error, "Agent failed task");
            agent.finish_task(false);
            shared.totals.failed.fetch_add(1, Ordering::SeqCst);
            shared.events.emit(OrchestratorEvent::TaskFailed {
                agent_id: agent_id.to_string(),
                task_id,
                error,
            });
        }
    }
}

/// Wait for the worker to exit, then emit its final event and remove it,
/// in that order.
async fn watch_exit(
    shared: Shared,
    agent_id: String,
    mut child: Child,
    kill: CancellationToken,
    output: Option<tokio::task::JoinHandle<()>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            tracing::info!(agent_id = %agent_id, "Killing worker");
            let _ = child.start_kill();
            child.wait().await
        }
    };
    // Drain remaining output so late reports land before the final event.
    // A grandchild can hold the pipe open past the worker's exit.
    if let Some(mut output) = output {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut output).await.is_err() {
            tracing::debug!(agent_id = %agent_id, "Worker output still open after exit, detaching");
            output.abort();
        }
    }

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    let success = exit_code == Some(0);

    // A worker that died mid-task never reported it; hand it back.
    let orphaned = shared
        .agents
        .read()
        .await
        .get(&agent_id)
        .and_then(|a| a.current_task_id().map(str::to_string));
    if let Some(task_id) = orphaned {
        let error = exit_description(exit_code, kill.is_cancelled());
        shared.dispatcher.fail_task(&task_id, &agent_id, &error).await;
        shared.totals.failed.fetch_add(1, Ordering::SeqCst);
    }

    let mut agents = shared.agents.write().await;
    if let Some(agent) = agents.get_mut(&agent_id) {
        agent.mark_exited(success);
        let event = if success {
            tracing::info!(agent_id = %agent_id, completed = agent.completed, failed = agent.failed, "Worker exited");
            OrchestratorEvent::AgentCompleted {
                agent_id: agent_id.clone(),
                exit_code,
                completed: agent.completed,
                failed: agent.failed,
            }
        } else {
            let error = match &status {
                Ok(_) => exit_description(exit_code, kill.is_cancelled()),
                Err(e) => format!("wait failed: {e}"),
            };
            tracing::warn!(agent_id = %agent_id, exit_code = ?exit_code, error = %error, "Worker failed");
            OrchestratorEvent::AgentFailed {
                agent_id: agent_id.clone(),
                exit_code,
                completed: agent.completed,
                failed: agent.failed,
                error,
            }
        };
        shared.events.emit(event);
    }
    agents.remove(&agent_id);
}

fn exit_description(code: Option<i32>, killed: bool) -> String {
    match (code, killed) {
        (_, true) => "worker killed by orchestrator".to_string(),
        (Some(code), false) => format!("worker exited with code {code}"),
        (None, false) => "worker terminated by signal".to_string(),
    }
}
