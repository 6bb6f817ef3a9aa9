//! Task extraction helpers for the intake stage.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::types::{SizeLabel, Task, TaskStatus};

static BOLD_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*\(\s*([^)*]*?)\s*\)\*\*").expect("valid regex"));
static SIZE_FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsize\s*[:=]\s*([A-Za-z]+)").expect("valid regex"));
static LEADING_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[\(\[]\s*([A-Za-z]{1,6})\s*[\)\]]").expect("valid regex"));

/// Task as reported by the intake stage, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTask {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent: Option<String>,
}

/// Extract the raw size marker from a task description, if any.
///
/// Recognized forms: `**(S)**`, `size: M`, and a leading `(L)` / `[L]`.
/// The token is returned verbatim; [`SizeLabel::parse`] decides whether it is known.
pub fn extract_size_marker(description: &str) -> Option<String> {
    [&*BOLD_MARKER_RE, &*SIZE_FIELD_RE, &*LEADING_MARKER_RE]
        .iter()
        .find_map(|re| re.captures(description))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Parsed size label for a task description.
pub fn task_size(description: &str) -> Option<SizeLabel> {
    extract_size_marker(description).and_then(|raw| SizeLabel::parse(&raw))
}

/// Turn intake output into the run's task list.
///
/// Empty descriptions are dropped and ids are reassigned 1..n in order. When
/// nothing usable remains, a single task is synthesized from `fallback`.
pub fn normalize_tasks(raw: Vec<RawTask>, fallback: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = raw
        .into_iter()
        .filter(|task| !task.description.trim().is_empty())
        .enumerate()
        .map(|(index, task)| Task {
            id: index as u32 + 1,
            description: task.description.trim().to_string(),
            agent: task
                .agent
                .map(|agent| agent.trim().to_string())
                .filter(|agent| !agent.is_empty()),
            status: TaskStatus::Pending,
            review_attempts: 0,
        })
        .collect();
    if tasks.is_empty() {
        tasks.push(Task {
            id: 1,
            description: fallback.trim().to_string(),
            agent: None,
            status: TaskStatus::Pending,
            review_attempts: 0,
        });
    }
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(description: &str) -> RawTask {
        RawTask {
            description: description.to_string(),
            agent: None,
        }
    }

    #[test]
    fn extracts_bold_marker() {
        assert_eq!(
            extract_size_marker("**(S)** Fix typo"),
            Some("S".to_string())
        );
        assert_eq!(task_size("**(S)** Fix typo"), Some(SizeLabel::Small));
    }

    #[test]
    fn extracts_size_field_and_leading_marker() {
        assert_eq!(task_size("Refactor parser (size: L)"), Some(SizeLabel::Large));
        assert_eq!(task_size("[M] add flag"), Some(SizeLabel::Medium));
        assert_eq!(task_size("(m) add flag"), Some(SizeLabel::Medium));
    }

    #[test]
    fn unknown_marker_is_returned_but_not_parsed() {
        assert_eq!(
            extract_size_marker("**(XL)** rewrite everything"),
            Some("XL".to_string())
        );
        assert_eq!(task_size("**(XL)** rewrite everything"), None);
    }

    #[test]
    fn descriptions_without_marker_have_no_size() {
        assert_eq!(extract_size_marker("Add retries to client"), None);
    }

    #[test]
    fn normalize_renumbers_and_drops_blank_tasks() {
        let tasks = normalize_tasks(
            vec![raw("  first  "), raw(""), raw("second")],
            "fallback",
        );
        let ids: Vec<u32> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(tasks[0].description, "first");
        assert_eq!(tasks[1].description, "second");
    }

    #[test]
    fn normalize_falls_back_to_single_task() {
        let tasks = normalize_tasks(Vec::new(), "Fix login redirect");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, 1);
        assert_eq!(tasks[0].description, "Fix login redirect");
    }

    #[test]
    fn blank_agent_names_are_dropped() {
        let tasks = normalize_tasks(
            vec![RawTask {
                description: "task".to_string(),
                agent: Some("  ".to_string()),
            }],
            "fallback",
        );
        assert_eq!(tasks[0].agent, None);
    }
}
