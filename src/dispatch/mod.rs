//! Task dispatch: the assign/complete/fail operations agents go through.
//!
//! Picking is by priority (`CRITICAL > HIGH > MEDIUM > LOW`), ties kept in
//! board order. Tasks locked by another agent are skipped until the lock
//! expires. Claiming is mirrored on the server: the task moves to
//! `IN_PROGRESS`, is assigned to the agent, and locked for
//! [`DEFAULT_LOCK_TTL`](crate::api::DEFAULT_LOCK_TTL).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::api::{DEFAULT_LOCK_TTL, Task, TaskApi, TaskStatus, TaskUpdate};
use crate::error::OrchestratorError;
use crate::orchestrator::agent::AgentTable;

/// Choose the next task for `agent_id` from `tasks` (in discovery order).
///
/// Falls back to the first eligible task when none carries a known
/// priority.
pub fn pick_task<'a>(tasks: &'a [Task], agent_id: &str, now: DateTime<Utc>) -> Option<&'a Task> {
    let eligible: Vec<&Task> = tasks
        .iter()
        .filter(|t| !t.lock.as_ref().is_some_and(|l| l.blocks(agent_id, now)))
        .collect();

    let mut ranked: Vec<(u8, &Task)> = eligible
        .iter()
        .filter_map(|t| t.priority.and_then(|p| p.rank()).map(|r| (r, *t)))
        .collect();
    // Stable: equal ranks keep discovery order.
    ranked.sort_by_key(|(rank, _)| *rank);

    ranked
        .first()
        .map(|(_, t)| *t)
        .or_else(|| eligible.first().copied())
}

/// Where tasks are looked up.
#[derive(Debug, Clone)]
pub struct DispatchScope {
    pub workspace_id: String,
    pub sprint_id: Option<String>,
}

pub struct Dispatcher {
    api: Arc<dyn TaskApi>,
    scope: DispatchScope,
    agents: AgentTable,
    lock_ttl: Duration,
    author: String,
    /// Tasks already completed in this run. Append-only.
    processed: Mutex<HashSet<String>>,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn TaskApi>, scope: DispatchScope, agents: AgentTable) -> Self {
        Self {
            api,
            scope,
            agents,
            lock_ttl: DEFAULT_LOCK_TTL,
            author: "foreman".to_string(),
            processed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Name used on comments.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn scope(&self) -> &DispatchScope {
        &self.scope
    }

    pub fn api(&self) -> &Arc<dyn TaskApi> {
        &self.api
    }

    pub fn agents(&self) -> &AgentTable {
        &self.agents
    }

    pub async fn is_processed(&self, task_id: &str) -> bool {
        self.processed.lock().await.contains(task_id)
    }

    /// Available tasks in scope, minus the ones already processed.
    pub async fn available_tasks(&self) -> Result<Vec<Task>, OrchestratorError> {
        let tasks = self
            .api
            .list_available_tasks(&self.scope.workspace_id, self.scope.sprint_id.as_deref())
            .await?;
        let processed = self.processed.lock().await;
        Ok(tasks
            .into_iter()
            .filter(|t| !processed.contains(&t.id))
            .collect())
    }

    /// Claim the highest-priority available task for `agent_id`.
    ///
    /// Returns `Ok(None)` when there is nothing to do. If the lock cannot
    /// be taken (another agent won the race) the next candidate is tried.
    pub async fn assign_task_to_agent(&self, agent_id: &str) -> Result<Option<Task>, OrchestratorError> {
        if !self.agents.read().await.contains_key(agent_id) {
            return Err(OrchestratorError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }

        let mut candidates = self.available_tasks().await?;
        loop {
            let Some(task) = pick_task(&candidates, agent_id, Utc::now()).cloned() else {
                tracing::debug!(agent_id = %agent_id, "No task available");
                return Ok(None);
            };

            if let Err(e) = self.api.lock_task(&task.id, agent_id, self.lock_ttl).await {
                tracing::warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "Could not lock task, trying next");
                candidates.retain(|t| t.id != task.id);
                continue;
            }

            let update = TaskUpdate::status(TaskStatus::InProgress).assign(agent_id);
            let claimed = match self.api.update_task(&task.id, &update).await {
                Ok(updated) => updated,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to mark task in progress");
                    if let Err(e) = self.api.unlock_task(&task.id, agent_id).await {
                        tracing::warn!(task_id = %task.id, error = %e, "Failed to release lock");
                    }
                    return Err(e.into());
                }
            };

            if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
                agent.start_task(&claimed.id);
            }
            tracing::info!(
                task_id = %claimed.id,
                agent_id = %agent_id,
                priority = ?claimed.priority,
                title = %claimed.title,
                "Task assigned"
            );
            return Ok(Some(claimed));
        }
    }

    /// Move a task to verification and put the agent back to idle.
    ///
    /// Completing the same task twice is a no-op.
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        summary: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        if self.is_processed(task_id).await {
            tracing::debug!(task_id = %task_id, "Task already completed");
            return Ok(());
        }

        self.api
            .update_task(task_id, &TaskUpdate::status(TaskStatus::NeedsVerification))
            .await?;
        self.processed.lock().await.insert(task_id.to_string());

        if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
            let body = format!("Completed by agent {agent_id}.\n\n{summary}");
            if let Err(e) = self.api.add_comment(task_id, &self.author, &body).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to add completion comment");
            }
        }
        self.release(task_id, agent_id).await;

        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.finish_task(true);
        }
        tracing::info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
        Ok(())
    }

    /// Return a task to the backlog after a failed attempt.
    ///
    /// API errors are logged, never returned: a failed task must not stop
    /// the caller's loop.
    pub async fn fail_task(&self, task_id: &str, agent_id: &str, error: &str) {
        let update = TaskUpdate::status(TaskStatus::Backlog).unassign();
        if let Err(e) = self.api.update_task(task_id, &update).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to return task to backlog");
        }

        let body = format!("Agent {agent_id} failed: {error}");
        if let Err(e) = self.api.add_comment(task_id, &self.author, &body).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to add failure comment");
        }
        self.release(task_id, agent_id).await;

        if let Some(agent) = self.agents.write().await.get_mut(agent_id) {
            agent.finish_task(false);
        }
        tracing::warn!(task_id = %task_id, agent_id = %agent_id, error = %error, "Task failed");
    }

    async fn release(&self, task_id: &str, agent_id: &str) {
        if let Err(e) = self.api.unlock_task(task_id, agent_id).await {
            tracing::debug!(task_id = %task_id, error = %e, "Failed to release task lock");
        }
    }
}
