//! Session protocol state machine.
//!
//! Every legal move is a row in [`TRANSITIONS`]. [`get_next_status`] is the
//! single lookup; nothing else decides whether a session may change state.

use serde::{Deserialize, Serialize};

/// Lifecycle status of one execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, nothing launched yet.
    Idle,
    /// Process launch requested.
    Starting,
    /// Process is up, no text produced yet.
    Running,
    /// Text is flowing.
    Streaming,
    /// Finished with a result.
    Completed,
    /// Stopped by the caller.
    Canceled,
    /// Lost the process without a deliberate stop.
    Interrupted,
    /// Finished with an error.
    Failed,
    /// Relaunching an interrupted session.
    Resuming,
}

impl SessionStatus {
    /// Every status, in declaration order.
    pub const ALL: [SessionStatus; 9] = [
        Self::Idle,
        Self::Starting,
        Self::Running,
        Self::Streaming,
        Self::Completed,
        Self::Canceled,
        Self::Interrupted,
        Self::Failed,
        Self::Resuming,
    ];

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    /// Whether a process is (or is about to be) attached to the session.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Streaming | Self::Resuming
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
            Self::Resuming => "resuming",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolEvent {
    CreateSession,
    CliSpawned,
    SpawnFailed,
    FirstTextDelta,
    ResultReceived,
    ErrorReceived,
    Cancel,
    ProcessCrashed,
    ResumeRequested,
}

impl ProtocolEvent {
    /// Every event, in declaration order.
    pub const ALL: [ProtocolEvent; 9] = [
        Self::CreateSession,
        Self::CliSpawned,
        Self::SpawnFailed,
        Self::FirstTextDelta,
        Self::ResultReceived,
        Self::ErrorReceived,
        Self::Cancel,
        Self::ProcessCrashed,
        Self::ResumeRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateSession => "create_session",
            Self::CliSpawned => "cli_spawned",
            Self::SpawnFailed => "spawn_failed",
            Self::FirstTextDelta => "first_text_delta",
            Self::ResultReceived => "result_received",
            Self::ErrorReceived => "error_received",
            Self::Cancel => "cancel",
            Self::ProcessCrashed => "process_crashed",
            Self::ResumeRequested => "resume_requested",
        }
    }
}

impl std::fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

use ProtocolEvent as E;
use SessionStatus as S;

/// The transition table: `(from, event, to)`.
pub const TRANSITIONS: &[(SessionStatus, ProtocolEvent, SessionStatus)] = &[
    // Launch
    (S::Idle, E::CreateSession, S::Starting),
    (S::Starting, E::CliSpawned, S::Running),
    (S::Starting, E::SpawnFailed, S::Failed),
    (S::Running, E::FirstTextDelta, S::Streaming),
    // Resume
    (S::Interrupted, E::ResumeRequested, S::Resuming),
    (S::Resuming, E::CliSpawned, S::Running),
    (S::Resuming, E::SpawnFailed, S::Failed),
    // Results
    (S::Running, E::ResultReceived, S::Completed),
    (S::Streaming, E::ResultReceived, S::Completed),
    (S::Running, E::ErrorReceived, S::Failed),
    (S::Streaming, E::ErrorReceived, S::Failed),
    // Cancellation
    (S::Starting, E::Cancel, S::Canceled),
    (S::Running, E::Cancel, S::Canceled),
    (S::Streaming, E::Cancel, S::Canceled),
    (S::Resuming, E::Cancel, S::Canceled),
    (S::Interrupted, E::Cancel, S::Canceled),
    // Crash / disconnect
    (S::Starting, E::ProcessCrashed, S::Interrupted),
    (S::Running, E::ProcessCrashed, S::Interrupted),
    (S::Streaming, E::ProcessCrashed, S::Interrupted),
    (S::Resuming, E::ProcessCrashed, S::Interrupted),
    // Fresh start from a finished or interrupted session
    (S::Interrupted, E::CreateSession, S::Starting),
    (S::Completed, E::CreateSession, S::Starting),
    (S::Canceled, E::CreateSession, S::Starting),
    (S::Failed, E::CreateSession, S::Starting),
];

/// Look up the status reached from `from` on `event`, if the table allows it.
pub fn get_next_status(from: SessionStatus, event: ProtocolEvent) -> Option<SessionStatus> {
    TRANSITIONS
        .iter()
        .find(|(f, e, _)| *f == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// Whether `event` is accepted in state `from`.
pub fn is_valid_transition(from: SessionStatus, event: ProtocolEvent) -> bool {
    get_next_status(from, event).is_some()
}

/// Events accepted in `from`, in table order.
pub fn accepted_events(from: SessionStatus) -> Vec<ProtocolEvent> {
    TRANSITIONS
        .iter()
        .filter(|(f, _, _)| *f == from)
        .map(|(_, e, _)| *e)
        .collect()
}
