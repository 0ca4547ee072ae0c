//! Wire types shared with the task API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Task board column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    NeedsVerification,
    PrOpen,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "BACKLOG",
            Self::Todo => "TODO",
            Self::InProgress => "IN_PROGRESS",
            Self::NeedsVerification => "NEEDS_VERIFICATION",
            Self::PrOpen => "PR_OPEN",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority. Values the server sends that we do not know map to
/// `Unknown` and sort after every known priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

impl Priority {
    /// Dispatch rank, lowest first. `None` for `Unknown`.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Critical => Some(0),
            Self::High => Some(1),
            Self::Medium => Some(2),
            Self::Low => Some(3),
            Self::Unknown => None,
        }
    }
}

/// Upper bound on a lock's lifetime.
const MAX_LOCK_DAYS: i64 = 365;

/// Exclusive claim on a task by one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLock {
    pub agent_id: String,
    pub expires_at: DateTime<Utc>,
}

impl TaskLock {
    pub fn new(agent_id: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(MAX_LOCK_DAYS))
            .min(chrono::Duration::days(MAX_LOCK_DAYS));
        Self {
            agent_id: agent_id.into(),
            expires_at: Utc::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether this lock keeps `agent_id` away from the task.
    pub fn blocks(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.agent_id != agent_id && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub sprint_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub lock: Option<TaskLock>,
}

impl Task {
    /// A TODO task with no priority, for tests and fixtures.
    pub fn new(id: impl Into<String>, workspace_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workspace_id: workspace_id.into(),
            sprint_id: None,
            title: title.into(),
            description: None,
            acceptance_criteria: Vec::new(),
            status: TaskStatus::Todo,
            priority: None,
            assignee_id: None,
            branch: None,
            lock: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_sprint(mut self, sprint_id: impl Into<String>) -> Self {
        self.sprint_id = Some(sprint_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Unassigned and waiting in TODO.
    pub fn is_available(&self) -> bool {
        self.status == TaskStatus::Todo && self.assignee_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sprint {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
}

/// Partial task update. `None` fields are left untouched;
/// `assignee_id: Some(None)` clears the assignee.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_or_null"
    )]
    pub assignee_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn assign(mut self, agent_id: impl Into<String>) -> Self {
        self.assignee_id = Some(Some(agent_id.into()));
        self
    }

    pub fn unassign(mut self) -> Self {
        self.assignee_id = Some(None);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Apply to a task in place.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(assignee) = &self.assignee_id {
            task.assignee_id = assignee.clone();
        }
        if let Some(branch) = &self.branch {
            task.branch = Some(branch.clone());
        }
    }
}

/// Distinguishes an explicit `null` from an absent field.
fn present_or_null<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub task_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
}

/// Outcome payload of a successful job run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunResult {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Persisted record of one job execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: String,
    pub workspace_id: String,
    pub job_type: String,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JobRunResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobRun {
    pub workspace_id: String,
    pub job_type: String,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunUpdate {
    pub status: JobRunStatus,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobRunResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRunUpdate {
    pub fn completed(result: JobRunResult) -> Self {
        Self {
            status: JobRunStatus::Completed,
            completed_at: Utc::now(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobRunStatus::Failed,
            completed_at: Utc::now(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuggestionStatus {
    Pending,
    AutoApproved,
}

/// Follow-up work proposed by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSuggestion {
    pub job_run_id: String,
    pub workspace_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub status: SuggestionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: String,
    #[serde(flatten)]
    pub fields: NewSuggestion,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_priority_deserializes() {
        let p: Priority = serde_json::from_str(r#""URGENT""#).unwrap();
        assert_eq!(p, Priority::Unknown);
        assert_eq!(p.rank(), None);
        assert!(Priority::Critical.rank() < Priority::Low.rank());
    }

    #[test]
    fn task_wire_format_is_camel_case() {
        let task = Task::new("t1", "ws", "Fix login").with_priority(Priority::High);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["workspaceId"], "ws");
        assert_eq!(json["status"], "TODO");
        assert_eq!(json["priority"], "HIGH");

        let minimal = r#"{"id":"t2","workspaceId":"ws","title":"x","status":"IN_PROGRESS"}"#;
        let parsed: Task = serde_json::from_str(minimal).unwrap();
        assert_eq!(parsed.status, TaskStatus::InProgress);
        assert!(parsed.acceptance_criteria.is_empty());
    }

    #[test]
    fn update_distinguishes_unassign_from_untouched() {
        let untouched = TaskUpdate::status(TaskStatus::Done);
        let json = serde_json::to_value(&untouched).unwrap();
        assert!(json.get("assigneeId").is_none());

        let cleared = TaskUpdate::status(TaskStatus::Backlog).unassign();
        let json = serde_json::to_string(&cleared).unwrap();
        assert!(json.contains(r#""assigneeId":null"#));
        let parsed: TaskUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.assignee_id, Some(None));

        let parsed: TaskUpdate = serde_json::from_str(r#"{"status":"DONE"}"#).unwrap();
        assert_eq!(parsed.assignee_id, None);
    }

    #[test]
    fn apply_update() {
        let mut task = Task::new("t1", "ws", "x");
        TaskUpdate::status(TaskStatus::InProgress).assign("agent-1").apply_to(&mut task);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee_id.as_deref(), Some("agent-1"));
        TaskUpdate::status(TaskStatus::Backlog).unassign().apply_to(&mut task);
        assert_eq!(task.assignee_id, None);
    }

    #[test]
    fn lock_expiry() {
        let lock = TaskLock::new("agent-1", Duration::from_secs(60));
        let now = Utc::now();
        assert!(!lock.is_expired(now));
        assert!(lock.blocks("agent-2", now));
        assert!(!lock.blocks("agent-1", now));
        assert!(!lock.blocks("agent-2", now + chrono::Duration::seconds(120)));
    }

    #[test]
    fn severity_orders_by_impact() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::High < Severity::Critical);
        let s: Severity = serde_json::from_str(r#""medium""#).unwrap();
        assert_eq!(s, Severity::Medium);
    }
}
