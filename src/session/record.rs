//! Session record owned by a runner for the lifetime of one invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{ProtocolEvent, SessionStatus, get_next_status};
use crate::error::SessionError;

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionStatus,
    pub event: ProtocolEvent,
    pub to: SessionStatus,
    pub timestamp: DateTime<Utc>,
}

/// Token counts reported by the assistant, when it reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One execution of a prompt against an external assistant process.
///
/// `status` is private: the only way to move it is [`Session::apply`],
/// which consults the transition table.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    status: SessionStatus,
    pub model: Option<String>,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage: TokenUsage,
    pub tool_calls: u32,
    pub text_chars: usize,
    transitions: Vec<StateTransition>,
}

impl Session {
    /// Create an idle session.
    pub fn new(provider: impl Into<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Idle,
            model,
            provider: provider.into(),
            created_at: now,
            updated_at: now,
            usage: TokenUsage::default(),
            tool_calls: 0,
            text_chars: 0,
            transitions: Vec::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Feed an event through the transition table.
    pub fn apply(&mut self, event: ProtocolEvent) -> Result<SessionStatus, SessionError> {
        let to = get_next_status(self.status, event).ok_or_else(|| {
            SessionError::InvalidTransition {
                session_id: self.id.clone(),
                from: self.status.to_string(),
                event: event.to_string(),
            }
        })?;

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            event,
            to,
            timestamp: now,
        });

        // Cap transition history to prevent unbounded memory growth
        const MAX_TRANSITIONS: usize = 64;
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = to;
        self.updated_at = now;
        Ok(to)
    }

    /// Apply `event` only if the table accepts it. Returns whether it moved.
    pub fn try_apply(&mut self, event: ProtocolEvent) -> bool {
        self.apply(event).is_ok()
    }

    pub fn record_text(&mut self, chars: usize) {
        self.text_chars += chars;
    }

    pub fn record_tool(&mut self) {
        self.tool_calls += 1;
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage.input_tokens += usage.input_tokens;
        self.usage.output_tokens += usage.output_tokens;
    }

    /// Milliseconds between creation and the last update.
    pub fn duration_ms(&self) -> u64 {
        self.updated_at
            .signed_duration_since(self.created_at)
            .num_milliseconds()
            .max(0) as u64
    }
}
