//! Built-in `lint` job: asks the assistant to review the code and turns
//! its findings into suggestions.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::api::Severity;
use crate::jobs::registry::{JobContext, JobHandler, JobResult, SuggestionDraft};
use crate::runner::{CliRunner, Runner, RunnerConfig};

pub const LINT_JOB: &str = "lint";

pub struct LintJob {
    runner_config: RunnerConfig,
}

impl LintJob {
    pub fn new(runner_config: RunnerConfig) -> Self {
        Self { runner_config }
    }
}

fn lint_prompt(paths: &str, focus: Option<&str>) -> String {
    let mut prompt = format!(
        "Review the code under `{paths}` for bugs, unsafe patterns, dead code and style problems. \
         Do not modify any files.\n"
    );
    if let Some(focus) = focus {
        prompt.push_str(&format!("Focus on: {focus}\n"));
    }
    prompt.push_str(
        "\nEnd your answer with a ```json fenced block containing an array of findings, each \
         {\"title\", \"description\", \"severity\" (info|low|medium|high|critical), \"file\"}. \
         Use an empty array when there is nothing to report.\n",
    );
    prompt
}

#[derive(Debug, Deserialize)]
struct Finding {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, alias = "filePath", alias = "file_path", alias = "path")]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FindingsBlock {
    List(Vec<Finding>),
    Wrapped { findings: Vec<Finding> },
}

fn parse_severity(raw: &str) -> Option<Severity> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "info" | "note" | "hint" => Some(Severity::Info),
        "low" | "minor" => Some(Severity::Low),
        "medium" | "warning" | "moderate" => Some(Severity::Medium),
        "high" | "error" | "major" => Some(Severity::High),
        "critical" | "blocker" => Some(Severity::Critical),
        _ => None,
    }
}

/// The JSON payload of the last ```json fence. Without a fence, the
/// outermost brackets count only when they hold valid JSON; prose that
/// happens to contain brackets is not a findings block.
fn findings_json(output: &str) -> Option<&str> {
    if let Some(start) = output.rfind("```json") {
        let body = &output[start + "```json".len()..];
        let end = body.find("```").unwrap_or(body.len());
        return Some(body[..end].trim());
    }
    let start = output.find(['[', '{'])?;
    let end = output.rfind([']', '}'])?;
    if end <= start {
        return None;
    }
    let span = &output[start..=end];
    serde_json::from_str::<serde_json::Value>(span).is_ok().then_some(span)
}

/// Findings from the assistant's final answer. An answer without any
/// findings block yields none.
pub fn parse_findings(output: &str) -> anyhow::Result<Vec<SuggestionDraft>> {
    let Some(json) = findings_json(output) else {
        tracing::warn!("Lint output carried no findings block");
        return Ok(Vec::new());
    };
    let block: FindingsBlock = serde_json::from_str(json).context("malformed findings block")?;
    let findings = match block {
        FindingsBlock::List(findings) | FindingsBlock::Wrapped { findings } => findings,
    };
    Ok(findings
        .into_iter()
        .filter(|f| !f.title.trim().is_empty())
        .map(|f| SuggestionDraft {
            title: f.title.trim().to_string(),
            description: f.description,
            severity: f.severity.as_deref().and_then(parse_severity),
            file_path: f.file,
        })
        .collect())
}

#[async_trait]
impl JobHandler for LintJob {
    fn job_type(&self) -> &str {
        LINT_JOB
    }

    async fn run(&self, ctx: &JobContext) -> anyhow::Result<JobResult> {
        let paths = ctx.config.option_str("paths").unwrap_or(".");
        let prompt = lint_prompt(paths, ctx.config.option_str("focus"));
        let runner = CliRunner::new(self.runner_config.clone(), &ctx.project_path);
        let output = runner.run(&prompt).await.context("lint run failed")?;

        let suggestions = parse_findings(&output)?;
        let mut files: Vec<String> = suggestions.iter().filter_map(|s| s.file_path.clone()).collect();
        files.sort();
        files.dedup();
        tracing::info!(
            run_id = %ctx.job_run_id,
            findings = suggestions.len(),
            files = files.len(),
            "Lint finished"
        );

        let summary = match suggestions.len() {
            0 => "No lint findings".to_string(),
            1 => "1 lint finding".to_string(),
            n => format!("{n} lint findings across {} files", files.len()),
        };
        Ok(JobResult {
            summary,
            suggestions,
            ..JobResult::default()
        })
    }
}
