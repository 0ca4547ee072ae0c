//! Execution prompt for a claimed task.

use std::fmt::Write;
use std::path::Path;

use crate::api::Task;

/// Assemble the prompt handed to the assistant for `task`.
pub fn build_prompt(task: &Task, branch: Option<&str>, cwd: &Path) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "# Task {}: {}", task.id, task.title.trim());

    if let Some(description) = non_empty(task.description.as_deref()) {
        let _ = write!(prompt, "\n## Description\n\n{description}\n");
    }

    let criteria: Vec<&str> = task
        .acceptance_criteria
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if !criteria.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n\n");
        for criterion in criteria {
            let _ = writeln!(prompt, "- {criterion}");
        }
    }

    prompt.push_str("\n## Working environment\n\n");
    let _ = writeln!(prompt, "- Working directory: {}", cwd.display());
    match branch {
        Some(branch) => {
            let _ = writeln!(
                prompt,
                "- You are on branch `{branch}`. Commit your changes there; do not switch branches."
            );
        }
        None => prompt.push_str("- Work on the currently checked out branch.\n"),
    }
    prompt.push_str(
        "\nImplement the task, run the relevant tests, and finish with a short summary of what changed.\n",
    );
    prompt
}

fn non_empty(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_every_section() {
        let mut task = Task::new("42", "ws", "Add dark mode").with_description("Users want a dark theme.");
        task.acceptance_criteria = vec!["Toggle in settings".to_string(), "  ".to_string()];
        let prompt = build_prompt(&task, Some("task/42-add-dark-mode"), Path::new("/repo/wt"));

        assert!(prompt.starts_with("# Task 42: Add dark mode\n"));
        assert!(prompt.contains("## Description\n\nUsers want a dark theme."));
        assert!(prompt.contains("- Toggle in settings\n"));
        assert!(!prompt.contains("- \n"));
        assert!(prompt.contains("/repo/wt"));
        assert!(prompt.contains("`task/42-add-dark-mode`"));
    }

    #[test]
    fn omits_empty_sections() {
        let task = Task::new("7", "ws", "Tidy up");
        let prompt = build_prompt(&task, None, Path::new("/repo"));
        assert!(!prompt.contains("## Description"));
        assert!(!prompt.contains("## Acceptance criteria"));
        assert!(prompt.contains("currently checked out branch"));
    }
}
