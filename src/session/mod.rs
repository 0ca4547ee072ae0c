//! Execution sessions.
//!
//! - `state`: the transition table (idle → starting → running → streaming → terminal)
//! - `record`: the `Session` record a runner owns while it executes

pub mod record;
pub mod state;

pub use record::{Session, StateTransition, TokenUsage};
pub use state::{
    ProtocolEvent, SessionStatus, TRANSITIONS, accepted_events, get_next_status,
    is_valid_transition,
};
