//! Task API client.
//!
//! The board, its tasks, job-run records and suggestions live behind a REST
//! service. Everything in this crate talks to it through [`TaskApi`] so the
//! orchestrator, workers and jobs can be exercised against
//! [`InMemoryTaskApi`] in tests.

pub mod http;
pub mod memory;
pub mod model;

pub use http::HttpTaskApi;
pub use memory::InMemoryTaskApi;
pub use model::{
    Comment, JobRun, JobRunResult, JobRunStatus, JobRunUpdate, NewJobRun, NewSuggestion,
    Priority, Severity, Sprint, Suggestion, SuggestionStatus, Task, TaskLock, TaskStatus,
    TaskUpdate,
};

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ApiError;

/// Default lifetime of a task lock (30 minutes).
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Unassigned TODO tasks, in board order. `sprint_id = None` means the
    /// whole workspace.
    async fn list_available_tasks(
        &self,
        workspace_id: &str,
        sprint_id: Option<&str>,
    ) -> Result<Vec<Task>, ApiError>;

    async fn get_task(&self, task_id: &str) -> Result<Task, ApiError>;

    async fn get_active_sprint(&self, workspace_id: &str) -> Result<Option<Sprint>, ApiError>;

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, ApiError>;

    async fn add_comment(&self, task_id: &str, author: &str, body: &str) -> Result<(), ApiError>;

    async fn lock_task(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<TaskLock, ApiError>;

    async fn unlock_task(&self, task_id: &str, agent_id: &str) -> Result<(), ApiError>;

    async fn create_job_run(&self, run: &NewJobRun) -> Result<JobRun, ApiError>;

    async fn update_job_run(&self, run_id: &str, update: &JobRunUpdate) -> Result<JobRun, ApiError>;

    async fn create_suggestion(&self, suggestion: &NewSuggestion) -> Result<Suggestion, ApiError>;
}
