//! Recurring maintenance jobs.
//!
//! - `config`: job settings, cron parsing, autonomy rules, config sources
//! - `registry`: the `JobHandler` trait and type → handler lookup
//! - `runner`: one execution with its persisted run record
//! - `scheduler`: cron timers with overlap prevention
//! - `lint`: built-in handler driving the assistant as a reviewer

pub mod config;
pub mod lint;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use config::{
    AutonomyRules, FileConfigSource, JobConfig, JobConfigSource, JobSettings, ScheduleConfig,
    StaticConfigSource, normalize_cron,
};
pub use lint::{LINT_JOB, LintJob};
pub use registry::{JobContext, JobHandler, JobRegistry, JobResult, SuggestionDraft};
pub use runner::JobRunner;
pub use scheduler::{JobScheduler, SKIP_REASON_IN_PROGRESS, SchedulerEvent};
