//! Job configuration: which jobs exist, when they run, and what they may
//! do without a human.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::{Severity, SuggestionStatus};
use crate::error::ConfigError;

/// Default cap on suggestions persisted by one run.
pub const DEFAULT_MAX_SUGGESTIONS: usize = 20;

fn default_true() -> bool {
    true
}

fn default_max_suggestions() -> usize {
    DEFAULT_MAX_SUGGESTIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub cron_expression: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    /// Severity given to findings that do not carry their own.
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Handler-specific settings.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            severity: Severity::default(),
            enabled: true,
            options: serde_json::Map::new(),
        }
    }
}

impl JobConfig {
    pub fn scheduled(cron_expression: impl Into<String>) -> Self {
        Self {
            schedule: Some(ScheduleConfig {
                cron_expression: cron_expression.into(),
                enabled: true,
            }),
            ..Self::default()
        }
    }

    /// Cron expression when both the job and its schedule are enabled.
    pub fn active_schedule(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.schedule
            .as_ref()
            .filter(|s| s.enabled)
            .map(|s| s.cron_expression.as_str())
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }
}

/// What jobs may do on their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutonomyRules {
    /// Suggestions at or below this severity skip human review.
    #[serde(default)]
    pub auto_approve_severity: Option<Severity>,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions_per_run: usize,
}

impl Default for AutonomyRules {
    fn default() -> Self {
        Self {
            auto_approve_severity: None,
            max_suggestions_per_run: DEFAULT_MAX_SUGGESTIONS,
        }
    }
}

impl AutonomyRules {
    pub fn suggestion_status(&self, severity: Severity) -> SuggestionStatus {
        match self.auto_approve_severity {
            Some(max) if severity <= max => SuggestionStatus::AutoApproved,
            _ => SuggestionStatus::Pending,
        }
    }
}

/// The whole job configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    #[serde(default)]
    pub autonomy: AutonomyRules,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

impl JobSettings {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn with_job(mut self, job_type: impl Into<String>, config: JobConfig) -> Self {
        self.jobs.insert(job_type.into(), config);
        self
    }
}

/// Accept the five-field cron form by prepending a seconds field.
pub fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub fn parse_schedule(expression: &str) -> Result<cron::Schedule, String> {
    cron::Schedule::from_str(&normalize_cron(expression)).map_err(|e| format!("invalid cron: {e}"))
}

/// Where job settings come from.
#[async_trait]
pub trait JobConfigSource: Send + Sync {
    async fn load(&self) -> Result<JobSettings, ConfigError>;

    /// Last change time, when the source can tell. Used for reload polling.
    fn modified(&self) -> Option<SystemTime> {
        None
    }
}

/// JSON file on disk.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobConfigSource for FileConfigSource {
    async fn load(&self) -> Result<JobSettings, ConfigError> {
        let json = tokio::fs::read_to_string(&self.path).await?;
        JobSettings::from_json(&json).map_err(|e| match e {
            ConfigError::ParseError(msg) => {
                ConfigError::ParseError(format!("{}: {msg}", self.path.display()))
            }
            other => other,
        })
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Settings held in memory; `set` replaces them for the next load.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    settings: RwLock<JobSettings>,
}

impl StaticConfigSource {
    pub fn new(settings: JobSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    pub fn set(&self, settings: JobSettings) {
        if let Ok(mut current) = self.settings.write() {
            *current = settings;
        }
    }
}

#[async_trait]
impl JobConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<JobSettings, ConfigError> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| ConfigError::ParseError("settings lock poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_format() {
        let json = r#"{
            "autonomy": { "autoApproveSeverity": "low", "maxSuggestionsPerRun": 5 },
            "jobs": {
                "lint": {
                    "schedule": { "cronExpression": "0 3 * * *", "enabled": true },
                    "severity": "medium",
                    "enabled": true,
                    "options": { "paths": "src" }
                },
                "docs": { "enabled": false }
            }
        }"#;
        let settings = JobSettings::from_json(json).unwrap();
        assert_eq!(settings.autonomy.max_suggestions_per_run, 5);
        let lint = &settings.jobs["lint"];
        assert_eq!(lint.severity, Severity::Medium);
        assert_eq!(lint.active_schedule(), Some("0 3 * * *"));
        assert_eq!(lint.option_str("paths"), Some("src"));
        assert_eq!(settings.jobs["docs"].active_schedule(), None);
    }

    #[test]
    fn disabled_job_or_schedule_is_not_active() {
        let mut config = JobConfig::scheduled("* * * * *");
        assert!(config.active_schedule().is_some());
        config.enabled = false;
        assert!(config.active_schedule().is_none());

        let mut config = JobConfig::scheduled("* * * * *");
        if let Some(schedule) = config.schedule.as_mut() {
            schedule.enabled = false;
        }
        assert!(config.active_schedule().is_none());
    }

    #[test]
    fn cron_normalization() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("  0 0 3 * * *  "), "0 0 3 * * *");
        assert!(parse_schedule("0 3 * * *").is_ok());
        assert!(parse_schedule("0 0 3 * * * 2030").is_ok());
        assert!(parse_schedule("not a cron").is_err());
    }

    #[test]
    fn auto_approval_threshold() {
        let rules = AutonomyRules {
            auto_approve_severity: Some(Severity::Low),
            ..AutonomyRules::default()
        };
        assert_eq!(rules.suggestion_status(Severity::Info), SuggestionStatus::AutoApproved);
        assert_eq!(rules.suggestion_status(Severity::Low), SuggestionStatus::AutoApproved);
        assert_eq!(rules.suggestion_status(Severity::High), SuggestionStatus::Pending);
        assert_eq!(
            AutonomyRules::default().suggestion_status(Severity::Info),
            SuggestionStatus::Pending
        );
    }

    #[tokio::test]
    async fn file_source_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();
        let source = FileConfigSource::new(&path);
        let err = source.load().await.unwrap_err();
        assert!(err.to_string().contains("jobs.json"));
        assert!(source.modified().is_some());
    }
}
