//! Per-agent bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Live agents keyed by agent id.
pub type AgentTable = Arc<RwLock<HashMap<String, AgentState>>>;

pub fn new_agent_table() -> AgentTable {
    Arc::new(RwLock::new(HashMap::new()))
}

/// What an agent is doing. Only `Working` carries a task, so an agent
/// has a current task exactly when it is working.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Working {
        #[serde(rename = "currentTaskId")]
        task_id: String,
    },
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Working { .. } => "WORKING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: String,
    status: AgentStatus,
    pub completed: u32,
    pub failed: u32,
    pub last_heartbeat: DateTime<Utc>,
    /// OS process id, when the agent runs as a child process.
    pub pid: Option<u32>,
    /// Cancelling this kills the agent's process.
    pub kill: CancellationToken,
}

impl AgentState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: AgentStatus::Idle,
            completed: 0,
            failed: 0,
            last_heartbeat: Utc::now(),
            pid: None,
            kill: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> &AgentStatus {
        &self.status
    }

    pub fn current_task_id(&self) -> Option<&str> {
        match &self.status {
            AgentStatus::Working { task_id } => Some(task_id),
            _ => None,
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn start_task(&mut self, task_id: impl Into<String>) {
        self.status = AgentStatus::Working {
            task_id: task_id.into(),
        };
        self.heartbeat();
    }

    /// Count the outcome of the current task and go back to idle.
    pub fn finish_task(&mut self, success: bool) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.status = AgentStatus::Idle;
        self.heartbeat();
    }

    pub fn set_idle(&mut self) {
        self.status = AgentStatus::Idle;
        self.heartbeat();
    }

    /// Final status once the process is gone.
    pub fn mark_exited(&mut self, success: bool) {
        self.status = if success {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id.clone(),
            status: self.status.clone(),
            completed: self.completed,
            failed: self.failed,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Serializable view of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub status: AgentStatus,
    pub completed: u32,
    pub failed: u32,
    pub last_heartbeat: DateTime<Utc>,
}
