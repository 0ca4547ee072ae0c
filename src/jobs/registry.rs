//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{JobRunResult, Severity, TaskApi};
use crate::jobs::config::{AutonomyRules, JobConfig};

/// Everything a handler gets for one run.
#[derive(Clone)]
pub struct JobContext {
    pub job_type: String,
    pub job_run_id: String,
    pub workspace_id: String,
    pub project_path: PathBuf,
    pub config: JobConfig,
    pub autonomy: AutonomyRules,
    pub api: Arc<dyn TaskApi>,
}

/// A finding a job wants recorded as a suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestionDraft {
    pub title: String,
    pub description: String,
    /// `None` takes the job's configured severity.
    pub severity: Option<Severity>,
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    pub summary: String,
    pub files_changed: Vec<String>,
    pub pr_url: Option<String>,
    pub errors: Vec<String>,
    pub suggestions: Vec<SuggestionDraft>,
}

impl JobResult {
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    /// The part persisted on the run record.
    pub fn run_result(&self) -> JobRunResult {
        JobRunResult {
            summary: self.summary.clone(),
            files_changed: self.files_changed.clone(),
            pr_url: self.pr_url.clone(),
            errors: self.errors.clone(),
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<JobResult>;
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own job type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "Replaced job handler");
        }
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl JobHandler for Named {
        fn job_type(&self) -> &str {
            self.0
        }

        async fn run(&self, _ctx: &JobContext) -> anyhow::Result<JobResult> {
            Ok(JobResult::summary(self.0))
        }
    }

    #[test]
    fn lookup_by_type() {
        let mut registry = JobRegistry::new();
        registry.register(Arc::new(Named("lint")));
        registry.register(Arc::new(Named("docs")));
        assert!(registry.contains("lint"));
        assert!(registry.get("tests").is_none());
        assert_eq!(registry.job_types(), ["docs", "lint"]);
    }

    #[test]
    fn run_result_drops_suggestions() {
        let mut result = JobResult::summary("3 findings");
        result.files_changed.push("src/lib.rs".to_string());
        result.suggestions.push(SuggestionDraft {
            title: "t".to_string(),
            description: "d".to_string(),
            severity: Some(Severity::High),
            file_path: None,
        });
        let persisted = result.run_result();
        assert_eq!(persisted.summary, "3 findings");
        assert_eq!(persisted.files_changed, ["src/lib.rs"]);
    }
}
