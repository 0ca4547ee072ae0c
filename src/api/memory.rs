//! In-process [`TaskApi`] backed by plain collections.
//!
//! Used by tests and by `foreman run-job --dry-run`. Individual calls can be
//! made to fail to exercise error paths.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::TaskApi;
use super::model::{
    Comment, JobRun, JobRunUpdate, NewJobRun, NewSuggestion, Sprint, Suggestion, Task, TaskLock,
    TaskUpdate,
};
use crate::error::ApiError;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListTasks,
    ActiveSprint,
    UpdateTask,
    AddComment,
    LockTask,
    CreateJobRun,
    UpdateJobRun,
    CreateSuggestion,
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    active_sprint: Option<Sprint>,
    comments: Vec<Comment>,
    job_runs: Vec<JobRun>,
    suggestions: Vec<Suggestion>,
    failing: HashSet<FailPoint>,
}

#[derive(Debug, Default)]
pub struct InMemoryTaskApi {
    state: Mutex<MemoryState>,
}

impl InMemoryTaskApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let api = Self::new();
        for task in tasks {
            api.insert_task(task);
        }
        api
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_task(&self, task: Task) {
        self.lock().tasks.push(task);
    }

    pub fn set_active_sprint(&self, sprint: Option<Sprint>) {
        self.lock().active_sprint = sprint;
    }

    /// Make `point` fail (or succeed again) on subsequent calls.
    pub fn set_failing(&self, point: FailPoint, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing.insert(point);
        } else {
            state.failing.remove(&point);
        }
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.iter().find(|t| t.id == task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.clone()
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.lock().comments.clone()
    }

    pub fn job_runs(&self) -> Vec<JobRun> {
        self.lock().job_runs.clone()
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.lock().suggestions.clone()
    }

    fn check(state: &MemoryState, point: FailPoint) -> Result<(), ApiError> {
        if state.failing.contains(&point) {
            return Err(ApiError::Injected(format!("{point:?}")));
        }
        Ok(())
    }

    fn task_mut<'a>(state: &'a mut MemoryState, task_id: &str) -> Result<&'a mut Task, ApiError> {
        state
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| ApiError::NotFound {
                entity: "task".to_string(),
                id: task_id.to_string(),
            })
    }
}

#[async_trait]
impl TaskApi for InMemoryTaskApi {
    async fn list_available_tasks(
        &self,
        workspace_id: &str,
        sprint_id: Option<&str>,
    ) -> Result<Vec<Task>, ApiError> {
        let state = self.lock();
        Self::check(&state, FailPoint::ListTasks)?;
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.workspace_id == workspace_id && t.is_available())
            .filter(|t| sprint_id.is_none() || t.sprint_id.as_deref() == sprint_id)
            .cloned()
            .collect())
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, ApiError> {
        let mut state = self.lock();
        Self::task_mut(&mut state, task_id).map(|t| t.clone())
    }

    async fn get_active_sprint(&self, workspace_id: &str) -> Result<Option<Sprint>, ApiError> {
        let state = self.lock();
        Self::check(&state, FailPoint::ActiveSprint)?;
        Ok(state
            .active_sprint
            .clone()
            .filter(|s| s.workspace_id == workspace_id))
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::UpdateTask)?;
        let task = Self::task_mut(&mut state, task_id)?;
        update.apply_to(task);
        Ok(task.clone())
    }

    async fn add_comment(&self, task_id: &str, author: &str, body: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::AddComment)?;
        Self::task_mut(&mut state, task_id)?;
        state.comments.push(Comment {
            task_id: task_id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn lock_task(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<TaskLock, ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::LockTask)?;
        let task = Self::task_mut(&mut state, task_id)?;
        if let Some(existing) = task.lock.as_ref().filter(|l| l.blocks(agent_id, Utc::now())) {
            return Err(ApiError::Status {
                method: "POST".to_string(),
                path: format!("/api/tasks/{task_id}/lock"),
                status: 409,
                body: format!("locked by {}", existing.agent_id),
            });
        }
        let lock = TaskLock::new(agent_id, ttl);
        task.lock = Some(lock.clone());
        Ok(lock)
    }

    async fn unlock_task(&self, task_id: &str, agent_id: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        let task = Self::task_mut(&mut state, task_id)?;
        if task.lock.as_ref().is_some_and(|l| l.agent_id == agent_id) {
            task.lock = None;
        }
        Ok(())
    }

    async fn create_job_run(&self, run: &NewJobRun) -> Result<JobRun, ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::CreateJobRun)?;
        let record = JobRun {
            id: Uuid::new_v4().to_string(),
            workspace_id: run.workspace_id.clone(),
            job_type: run.job_type.clone(),
            status: run.status,
            started_at: run.started_at,
            completed_at: None,
            result: None,
            error: None,
        };
        state.job_runs.push(record.clone());
        Ok(record)
    }

    async fn update_job_run(&self, run_id: &str, update: &JobRunUpdate) -> Result<JobRun, ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::UpdateJobRun)?;
        let run = state
            .job_runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| ApiError::NotFound {
                entity: "job run".to_string(),
                id: run_id.to_string(),
            })?;
        run.status = update.status;
        run.completed_at = Some(update.completed_at);
        run.result = update.result.clone();
        run.error = update.error.clone();
        Ok(run.clone())
    }

    async fn create_suggestion(&self, suggestion: &NewSuggestion) -> Result<Suggestion, ApiError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::CreateSuggestion)?;
        let record = Suggestion {
            id: Uuid::new_v4().to_string(),
            fields: suggestion.clone(),
        };
        state.suggestions.push(record.clone());
        Ok(record)
    }
}
