//! Typed publish/subscribe for lifecycle events.
//!
//! Runners publish [`AgentEvent`]s; the orchestrator and scheduler publish
//! their own event enums through the same [`EventEmitter`]. Observers
//! (logging, UI bridges, persistence) subscribe without the publisher
//! knowing about them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::{SessionStatus, TokenUsage};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Fan-out channel for one event type. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventEmitter<T: Clone> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventEmitter<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Ok if nobody is listening.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Final numbers for a session, carried on `session_ended` so a persistence
/// layer can store the run without replaying the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub status: SessionStatus,
    pub text_chars: usize,
    pub tool_calls: u32,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Session lifecycle events. This set is closed: consumers match it
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    SessionStarted {
        session_id: String,
        provider: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    PromptSubmitted {
        session_id: String,
        prompt: String,
    },
    TextDelta {
        session_id: String,
        content: String,
    },
    ToolStarted {
        session_id: String,
        tool: String,
        tool_id: String,
    },
    ToolCompleted {
        session_id: String,
        tool: String,
        tool_id: String,
    },
    ThinkingStarted {
        session_id: String,
    },
    ThinkingStopped {
        session_id: String,
    },
    ResponseCompleted {
        session_id: String,
        content: String,
    },
    SessionEnded {
        session_id: String,
        summary: SessionSummary,
    },
    ErrorOccurred {
        session_id: String,
        error: String,
    },
}

impl AgentEvent {
    /// Every kind tag, matching the serde `type` field.
    pub const KINDS: [&'static str; 10] = [
        "session_started",
        "prompt_submitted",
        "text_delta",
        "tool_started",
        "tool_completed",
        "thinking_started",
        "thinking_stopped",
        "response_completed",
        "session_ended",
        "error_occurred",
    ];

    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::PromptSubmitted { session_id, .. }
            | Self::TextDelta { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolCompleted { session_id, .. }
            | Self::ThinkingStarted { session_id }
            | Self::ThinkingStopped { session_id }
            | Self::ResponseCompleted { session_id, .. }
            | Self::SessionEnded { session_id, .. }
            | Self::ErrorOccurred { session_id, .. } => session_id,
        }
    }

    /// The kind tag (matches serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::PromptSubmitted { .. } => "prompt_submitted",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ThinkingStarted { .. } => "thinking_started",
            Self::ThinkingStopped { .. } => "thinking_stopped",
            Self::ResponseCompleted { .. } => "response_completed",
            Self::SessionEnded { .. } => "session_ended",
            Self::ErrorOccurred { .. } => "error_occurred",
        }
    }

    /// Whether this is the last event a session produces.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEnded { .. })
    }
}

/// Write one agent event to the tracing log.
pub fn log_agent_event(event: &AgentEvent) {
    match event {
        AgentEvent::SessionStarted {
            session_id,
            provider,
            model,
        } => tracing::info!(
            session_id = %session_id,
            provider = %provider,
            model = model.as_deref().unwrap_or("default"),
            "Session started"
        ),
        AgentEvent::PromptSubmitted { session_id, prompt } => tracing::debug!(
            session_id = %session_id,
            prompt_chars = prompt.len(),
            "Prompt submitted"
        ),
        AgentEvent::TextDelta { session_id, content } => tracing::trace!(
            session_id = %session_id,
            chars = content.len(),
            "Text delta"
        ),
        AgentEvent::ToolStarted {
            session_id,
            tool,
            tool_id,
        } => tracing::info!(session_id = %session_id, tool = %tool, tool_id = %tool_id, "Tool started"),
        AgentEvent::ToolCompleted {
            session_id,
            tool,
            tool_id,
        } => tracing::debug!(session_id = %session_id, tool = %tool, tool_id = %tool_id, "Tool completed"),
        AgentEvent::ThinkingStarted { session_id } => {
            tracing::debug!(session_id = %session_id, "Thinking started")
        }
        AgentEvent::ThinkingStopped { session_id } => {
            tracing::debug!(session_id = %session_id, "Thinking stopped")
        }
        AgentEvent::ResponseCompleted {
            session_id,
            content,
        } => tracing::info!(
            session_id = %session_id,
            chars = content.len(),
            "Response completed"
        ),
        AgentEvent::SessionEnded {
            session_id,
            summary,
        } => tracing::info!(
            session_id = %session_id,
            status = %summary.status,
            tool_calls = summary.tool_calls,
            tokens = summary.usage.total(),
            duration_ms = summary.duration_ms,
            "Session ended"
        ),
        AgentEvent::ErrorOccurred { session_id, error } => {
            tracing::warn!(session_id = %session_id, error = %error, "Session error")
        }
    }
}

/// Spawn a task that logs every event published on `emitter`.
pub fn spawn_event_logger(emitter: &EventEmitter<AgentEvent>) -> tokio::task::JoinHandle<()> {
    let mut rx = emitter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_agent_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
