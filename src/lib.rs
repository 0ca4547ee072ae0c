//! foreman: runs coding assistants against a task board.
//!
//! An orchestrator spawns worker processes that claim tasks and drive an
//! assistant CLI on each; a scheduler runs recurring maintenance jobs.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod runner;
pub mod session;
pub mod vcs;
pub mod worker;

pub use error::{Error, Result};
