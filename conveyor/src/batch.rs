//! Batch mode: independent runs back-to-back behind a consecutive-failure breaker.

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use crate::controller::RunOutcome;
use crate::exit_codes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub issue: String,
    pub exit_code: i32,
    /// Run id on success, otherwise the failure reason.
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub entries: Vec<BatchEntry>,
    /// Issues never attempted because the breaker tripped.
    pub skipped: Vec<String>,
}

impl BatchReport {
    pub fn halted(&self) -> bool {
        !self.skipped.is_empty()
    }

    /// Exit code of the last failing run, or `OK` when every run succeeded.
    pub fn exit_code(&self) -> i32 {
        self.entries
            .iter()
            .rev()
            .map(|entry| entry.exit_code)
            .find(|code| *code != exit_codes::OK)
            .unwrap_or(exit_codes::OK)
    }
}

/// Run `run_one` for each issue in order.
///
/// A setup error counts as a failed run. The batch stops once
/// `max_consecutive_failures` runs in a row have failed; a success resets the count.
#[instrument(skip_all, fields(issues = issues.len(), max_consecutive_failures))]
pub fn run_batch<F>(issues: &[String], max_consecutive_failures: u32, mut run_one: F) -> BatchReport
where
    F: FnMut(&str) -> Result<RunOutcome>,
{
    let mut report = BatchReport::default();
    let mut consecutive = 0u32;

    for (index, issue) in issues.iter().enumerate() {
        let entry = match run_one(issue) {
            Ok(outcome) => {
                let detail = match &outcome {
                    RunOutcome::Completed { run_id } => run_id.clone(),
                    RunOutcome::Failed { status, reason, .. } => {
                        format!("{}: {reason}", status.as_str())
                    }
                };
                BatchEntry {
                    issue: issue.clone(),
                    exit_code: outcome.exit_code(),
                    detail,
                }
            }
            Err(err) => {
                error!(issue = %issue, err = %format!("{err:#}"), "run could not be started");
                BatchEntry {
                    issue: issue.clone(),
                    exit_code: exit_codes::FAILED,
                    detail: format!("{err:#}"),
                }
            }
        };

        if entry.exit_code == exit_codes::OK {
            consecutive = 0;
            info!(issue = %issue, "batch run succeeded");
        } else {
            consecutive += 1;
            warn!(issue = %issue, consecutive, "batch run failed");
        }
        report.entries.push(entry);

        if consecutive >= max_consecutive_failures {
            report.skipped = issues[index + 1..].to_vec();
            if !report.skipped.is_empty() {
                error!(
                    consecutive,
                    skipped = report.skipped.len(),
                    "too many consecutive failures, halting batch"
                );
            }
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::workflow::RunStatus;
    use anyhow::anyhow;

    fn issues(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn ok(issue: &str) -> Result<RunOutcome> {
        Ok(RunOutcome::Completed {
            run_id: format!("{issue}-run"),
        })
    }

    fn failed(issue: &str, status: RunStatus) -> Result<RunOutcome> {
        Ok(RunOutcome::Failed {
            run_id: format!("{issue}-run"),
            status,
            reason: "boom".to_string(),
        })
    }

    #[test]
    fn all_successes_exit_ok() {
        let report = run_batch(&issues(&["1", "2"]), 3, ok);
        assert_eq!(report.entries.len(), 2);
        assert!(!report.halted());
        assert_eq!(report.exit_code(), exit_codes::OK);
    }

    #[test]
    fn breaker_trips_after_consecutive_failures() {
        let mut calls = Vec::new();
        let report = run_batch(&issues(&["1", "2", "3", "4", "5"]), 2, |issue| {
            calls.push(issue.to_string());
            match issue {
                "1" => ok(issue),
                "2" => Err(anyhow!("gh not found")),
                _ => failed(issue, RunStatus::IterationCapExceeded),
            }
        });
        assert_eq!(calls, vec!["1", "2", "3"]);
        assert_eq!(report.skipped, issues(&["4", "5"]));
        assert_eq!(report.exit_code(), exit_codes::CAP_EXCEEDED);
    }

    #[test]
    fn success_resets_the_counter() {
        let report = run_batch(&issues(&["1", "2", "3", "4"]), 2, |issue| match issue {
            "1" | "3" => failed(issue, RunStatus::StageFailed),
            _ => ok(issue),
        });
        assert_eq!(report.entries.len(), 4);
        assert!(!report.halted());
        assert_eq!(report.exit_code(), exit_codes::FAILED);
    }
}
