//! Executes one job and keeps its run record in step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::api::{JobRunStatus, JobRunUpdate, NewJobRun, NewSuggestion, TaskApi};
use crate::error::JobError;
use crate::jobs::config::{AutonomyRules, JobConfig, JobSettings};
use crate::jobs::registry::{JobContext, JobRegistry, JobResult};

pub struct JobRunner {
    api: Arc<dyn TaskApi>,
    registry: Arc<JobRegistry>,
    workspace_id: String,
    project_path: PathBuf,
    /// Watchdog; `None` lets a handler run as long as it likes.
    timeout: Option<Duration>,
}

impl JobRunner {
    pub fn new(
        api: Arc<dyn TaskApi>,
        registry: Arc<JobRegistry>,
        workspace_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            api,
            registry,
            workspace_id: workspace_id.into(),
            project_path: project_path.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run `job_type` once.
    ///
    /// The run record goes RUNNING, then COMPLETED or FAILED. On failure
    /// the handler's error is returned even if marking the run failed
    /// did not work.
    pub async fn run_job(
        &self,
        job_type: &str,
        config: &JobConfig,
        autonomy: &AutonomyRules,
    ) -> Result<JobResult, JobError> {
        let handler = self.registry.get(job_type).ok_or_else(|| JobError::NoHandler {
            job_type: job_type.to_string(),
        })?;

        let run = self
            .api
            .create_job_run(&NewJobRun {
                workspace_id: self.workspace_id.clone(),
                job_type: job_type.to_string(),
                status: JobRunStatus::Running,
                started_at: Utc::now(),
            })
            .await?;
        tracing::info!(job_type = %job_type, run_id = %run.id, "Job started");

        let ctx = JobContext {
            job_type: job_type.to_string(),
            job_run_id: run.id.clone(),
            workspace_id: self.workspace_id.clone(),
            project_path: self.project_path.clone(),
            config: config.clone(),
            autonomy: autonomy.clone(),
            api: self.api.clone(),
        };

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handler.run(&ctx)).await {
                Ok(result) => result.map_err(|e| handler_error(job_type, &e)),
                Err(_) => Err(JobError::Timeout {
                    job_type: job_type.to_string(),
                    timeout,
                }),
            },
            None => handler.run(&ctx).await.map_err(|e| handler_error(job_type, &e)),
        };

        match outcome {
            Ok(result) => {
                let saved = self.persist_suggestions(&run.id, &result, config, autonomy).await;
                if let Err(e) = self
                    .api
                    .update_job_run(&run.id, &JobRunUpdate::completed(result.run_result()))
                    .await
                {
                    tracing::warn!(job_type = %job_type, run_id = %run.id, error = %e, "Failed to mark job run completed");
                }
                tracing::info!(
                    job_type = %job_type,
                    run_id = %run.id,
                    suggestions = saved,
                    summary = %result.summary,
                    "Job completed"
                );
                Ok(result)
            }
            Err(err) => {
                let message = match &err {
                    JobError::Handler { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                if let Err(e) = self
                    .api
                    .update_job_run(&run.id, &JobRunUpdate::failed(message.clone()))
                    .await
                {
                    tracing::warn!(job_type = %job_type, run_id = %run.id, error = %e, "Failed to mark job run failed");
                }
                tracing::warn!(job_type = %job_type, run_id = %run.id, error = %message, "Job failed");
                Err(err)
            }
        }
    }

    /// Save a run's suggestions up to the per-run cap. Returns how many
    /// were stored.
    async fn persist_suggestions(
        &self,
        run_id: &str,
        result: &JobResult,
        config: &JobConfig,
        autonomy: &AutonomyRules,
    ) -> usize {
        let cap = autonomy.max_suggestions_per_run;
        if result.suggestions.len() > cap {
            tracing::info!(
                run_id = %run_id,
                found = result.suggestions.len(),
                cap,
                "Suggestion cap reached, dropping the rest"
            );
        }

        let mut saved = 0;
        for draft in result.suggestions.iter().take(cap) {
            let severity = draft.severity.unwrap_or(config.severity);
            let suggestion = NewSuggestion {
                job_run_id: run_id.to_string(),
                workspace_id: self.workspace_id.clone(),
                title: draft.title.clone(),
                description: draft.description.clone(),
                severity,
                file_path: draft.file_path.clone(),
                status: autonomy.suggestion_status(severity),
            };
            match self.api.create_suggestion(&suggestion).await {
                Ok(_) => saved += 1,
                Err(e) => {
                    tracing::warn!(run_id = %run_id, title = %draft.title, error = %e, "Failed to save suggestion");
                }
            }
        }
        saved
    }

    /// Run every enabled job that has a handler. Failures are logged and
    /// skipped; the map holds results of the jobs that succeeded.
    pub async fn run_all_enabled(&self, settings: &JobSettings) -> HashMap<String, JobResult> {
        let mut results = HashMap::new();
        for (job_type, config) in &settings.jobs {
            if !config.enabled {
                continue;
            }
            if !self.registry.contains(job_type) {
                tracing::debug!(job_type = %job_type, "No handler registered, skipping");
                continue;
            }
            match self.run_job(job_type, config, &settings.autonomy).await {
                Ok(result) => {
                    results.insert(job_type.clone(), result);
                }
                Err(e) => {
                    tracing::warn!(job_type = %job_type, error = %e, "Job failed, continuing");
                }
            }
        }
        results
    }
}

fn handler_error(job_type: &str, error: &anyhow::Error) -> JobError {
    JobError::Handler {
        job_type: job_type.to_string(),
        message: format!("{error:#}"),
    }
}
