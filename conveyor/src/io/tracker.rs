//! Issue tracker boundary (`gh` CLI).

use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

pub trait IssueTracker {
    fn fetch_issue(&self, issue: &str) -> Result<Issue>;
    fn post_comment(&self, issue: &str, body: &str) -> Result<()>;
}

/// Tracker backed by the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhTracker {
    program: String,
}

impl GhTracker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .with_context(|| format!("spawn {} {}", self.program, args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl IssueTracker for GhTracker {
    #[instrument(skip_all, fields(issue))]
    fn fetch_issue(&self, issue: &str) -> Result<Issue> {
        let out = self.run(&["issue", "view", issue, "--json", "title,body"])?;
        let parsed: Issue =
            serde_json::from_str(&out).with_context(|| format!("parse issue {issue}"))?;
        debug!(title = %parsed.title, "fetched issue");
        Ok(parsed)
    }

    fn post_comment(&self, issue: &str, body: &str) -> Result<()> {
        self.run(&["issue", "comment", issue, "--body", body])?;
        Ok(())
    }
}

/// Post a one-line progress comment. Never fails the run.
pub fn notify(tracker: &dyn IssueTracker, quiet: bool, issue: &str, message: &str) {
    if quiet {
        debug!(issue, message, "quiet mode, comment suppressed");
        return;
    }
    if let Err(err) = tracker.post_comment(issue, message) {
        warn!(issue, err = %format!("{err:#}"), "failed to post progress comment");
    }
}
