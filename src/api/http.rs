//! REST implementation of [`TaskApi`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::TaskApi;
use super::model::{
    JobRun, JobRunUpdate, NewJobRun, NewSuggestion, Sprint, Suggestion, Task, TaskLock, TaskUpdate,
};
use crate::error::ApiError;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies quoted in errors are cut to this many characters.
const ERROR_BODY_CHARS: usize = 500;

pub struct HttpTaskApi {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpTaskApi {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("foreman/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
    }

    /// Send and return the raw successful response.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ApiError> {
        let started = Instant::now();
        let mut req = self.request(method.clone(), path);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = &body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        tracing::debug!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task API call"
        );

        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status {
            method: method.to_string(),
            path: path.to_string(),
            status: status.as_u16(),
            body: body.chars().take(ERROR_BODY_CHARS).collect(),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        let resp = self.execute(method, path, body, query).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        self.execute(method, path, body, &[]).await.map(|_| ())
    }
}

fn json_body<T: Serialize>(path: &str, value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Decode {
        path: path.to_string(),
        reason: format!("request body: {e}"),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentBody<'a> {
    author: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LockBody<'a> {
    agent_id: &'a str,
    ttl_seconds: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnlockBody<'a> {
    agent_id: &'a str,
}

#[async_trait]
impl TaskApi for HttpTaskApi {
    async fn list_available_tasks(
        &self,
        workspace_id: &str,
        sprint_id: Option<&str>,
    ) -> Result<Vec<Task>, ApiError> {
        let path = format!("/api/workspaces/{workspace_id}/tasks");
        let mut query = vec![("status", "TODO"), ("unassigned", "true")];
        if let Some(sprint_id) = sprint_id {
            query.push(("sprintId", sprint_id));
        }
        self.call(Method::GET, &path, None, &query).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, ApiError> {
        let path = format!("/api/tasks/{task_id}");
        match self.call(Method::GET, &path, None, &[]).await {
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ApiError::NotFound {
                    entity: "task".to_string(),
                    id: task_id.to_string(),
                })
            }
            other => other,
        }
    }

    async fn get_active_sprint(&self, workspace_id: &str) -> Result<Option<Sprint>, ApiError> {
        let path = format!("/api/workspaces/{workspace_id}/sprints/active");
        match self.call::<Option<Sprint>>(Method::GET, &path, None, &[]).await {
            Err(ApiError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            other => other,
        }
    }

    async fn update_task(&self, task_id: &str, update: &TaskUpdate) -> Result<Task, ApiError> {
        let path = format!("/api/tasks/{task_id}");
        let body = json_body(&path, update)?;
        self.call(Method::PATCH, &path, Some(body), &[]).await
    }

    async fn add_comment(&self, task_id: &str, author: &str, text: &str) -> Result<(), ApiError> {
        let path = format!("/api/tasks/{task_id}/comments");
        let body = json_body(&path, &CommentBody { author, body: text })?;
        self.call_empty(Method::POST, &path, Some(body)).await
    }

    async fn lock_task(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<TaskLock, ApiError> {
        let path = format!("/api/tasks/{task_id}/lock");
        let body = json_body(
            &path,
            &LockBody {
                agent_id,
                ttl_seconds: ttl.as_secs(),
            },
        )?;
        self.call(Method::POST, &path, Some(body), &[]).await
    }

    async fn unlock_task(&self, task_id: &str, agent_id: &str) -> Result<(), ApiError> {
        let path = format!("/api/tasks/{task_id}/lock");
        let body = json_body(&path, &UnlockBody { agent_id })?;
        self.call_empty(Method::DELETE, &path, Some(body)).await
    }

    async fn create_job_run(&self, run: &NewJobRun) -> Result<JobRun, ApiError> {
        let path = format!("/api/workspaces/{}/job-runs", run.workspace_id);
        let body = json_body(&path, run)?;
        self.call(Method::POST, &path, Some(body), &[]).await
    }

    async fn update_job_run(&self, run_id: &str, update: &JobRunUpdate) -> Result<JobRun, ApiError> {
        let path = format!("/api/job-runs/{run_id}");
        let body = json_body(&path, update)?;
        self.call(Method::PATCH, &path, Some(body), &[]).await
    }

    async fn create_suggestion(&self, suggestion: &NewSuggestion) -> Result<Suggestion, ApiError> {
        let path = format!("/api/workspaces/{}/suggestions", suggestion.workspace_id);
        let body = json_body(&path, suggestion)?;
        self.call(Method::POST, &path, Some(body), &[]).await
    }
}
