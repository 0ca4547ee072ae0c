//! Line protocol from worker to orchestrator.
//!
//! Workers print `@@foreman {json}` lines on stdout between the assistant
//! output they forward. The orchestrator passes every line through and
//! parses these to keep its view of the agent current.

use std::io::Write;

use serde::{Deserialize, Serialize};

pub const REPORT_PREFIX: &str = "@@foreman ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    Heartbeat,
    TaskStarted {
        task_id: String,
        title: String,
    },
    TaskCompleted {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pr_url: Option<String>,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    /// No work left; the worker is about to exit.
    Idle,
}

impl WorkerReport {
    pub fn to_line(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"heartbeat"}"#.into());
        format!("{REPORT_PREFIX}{json}")
    }

    /// Parse a report line. `None` for ordinary output.
    pub fn parse_line(line: &str) -> Option<Self> {
        let json = line.trim_end().strip_prefix(REPORT_PREFIX)?;
        match serde_json::from_str(json) {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::debug!(error = %e, "Malformed worker report line");
                None
            }
        }
    }

    /// Write to stdout and flush so the report is not held behind buffered
    /// assistant output.
    pub fn emit(&self) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", self.to_line());
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_roundtrip() {
        let reports = [
            WorkerReport::Heartbeat,
            WorkerReport::TaskStarted {
                task_id: "t1".to_string(),
                title: "Fix login".to_string(),
            },
            WorkerReport::TaskCompleted {
                task_id: "t1".to_string(),
                pr_url: Some("https://example.test/pr/1".to_string()),
            },
            WorkerReport::TaskFailed {
                task_id: "t1".to_string(),
                error: "exit code 1".to_string(),
            },
            WorkerReport::Idle,
        ];
        for report in reports {
            let line = report.to_line();
            assert!(line.starts_with("@@foreman {"));
            assert_eq!(WorkerReport::parse_line(&line), Some(report));
        }
    }

    #[test]
    fn ordinary_output_is_not_a_report() {
        assert_eq!(WorkerReport::parse_line("Running tests..."), None);
        assert_eq!(WorkerReport::parse_line("@@foreman not-json"), None);
        assert_eq!(
            WorkerReport::parse_line("@@foreman {\"type\":\"idle\"}\r\n"),
            Some(WorkerReport::Idle)
        );
    }
}
