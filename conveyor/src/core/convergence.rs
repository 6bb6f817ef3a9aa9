//! Non-progress detection for refinement loops.
//!
//! Two detectors share one history format:
//!
//! - **Repeat ratio** (review-style loops): if at least `threshold` of the
//!   current findings were already reported by the previous recorded
//!   iteration, the loop stops and is treated as approved with a warning.
//! - **Failure signature** (test loop): the filtered failure set is hashed and
//!   the run is aborted once the same signature has been seen `max_repeats`
//!   times.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::types::{Finding, TestFailure};

/// One recorded loop iteration (`history/<prefix>.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Global iteration number for the loop kind.
    pub iteration: u32,
    pub findings: Vec<Finding>,
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvergencePolicy {
    RepeatRatio { threshold: f64 },
    FailureSignature { max_repeats: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceSignal {
    Continue,
    /// Findings are repeating; stop and approve with a warning.
    Converged,
    /// The same failure set keeps coming back; abort the run.
    Stuck { signature: String, occurrences: u32 },
}

/// Evaluate `current` against the history recorded before it.
///
/// Never fires on the first iteration.
pub fn evaluate(
    policy: ConvergencePolicy,
    current: &HistoryEntry,
    prior: &[HistoryEntry],
) -> ConvergenceSignal {
    if current.iteration <= 1 {
        return ConvergenceSignal::Continue;
    }
    match policy {
        ConvergencePolicy::RepeatRatio { threshold } => {
            let Some(previous) = prior.last() else {
                return ConvergenceSignal::Continue;
            };
            match repeat_ratio(&current.findings, &previous.findings) {
                Some(ratio) if ratio >= threshold => ConvergenceSignal::Converged,
                _ => ConvergenceSignal::Continue,
            }
        }
        ConvergencePolicy::FailureSignature { max_repeats } => {
            let Some(signature) = current.signature.as_deref() else {
                return ConvergenceSignal::Continue;
            };
            let occurrences = prior
                .iter()
                .filter(|entry| entry.signature.as_deref() == Some(signature))
                .count() as u32
                + 1;
            if occurrences >= max_repeats {
                ConvergenceSignal::Stuck {
                    signature: signature.to_string(),
                    occurrences,
                }
            } else {
                ConvergenceSignal::Continue
            }
        }
    }
}

/// Fraction of `current` findings whose description also appears in `previous`.
///
/// `None` when there are no current findings.
pub fn repeat_ratio(current: &[Finding], previous: &[Finding]) -> Option<f64> {
    if current.is_empty() {
        return None;
    }
    let seen: HashSet<&str> = previous
        .iter()
        .map(|finding| finding.description.as_str())
        .collect();
    let repeated = current
        .iter()
        .filter(|finding| seen.contains(finding.description.as_str()))
        .count();
    Some(repeated as f64 / current.len() as f64)
}

/// Stable hex digest of a failure set, independent of report order.
pub fn failure_signature(failures: &[TestFailure]) -> String {
    let keys: BTreeSet<String> = failures
        .iter()
        .map(|failure| format!("{}::{}", failure.file.as_deref().unwrap_or(""), failure.name))
        .collect();
    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Every finding from prior iterations, deduplicated by description, first seen first.
pub fn cumulative_findings(prior: &[HistoryEntry]) -> Vec<Finding> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for finding in prior.iter().flat_map(|entry| entry.findings.iter()) {
        if seen.insert(finding.description.clone()) {
            out.push(finding.clone());
        }
    }
    out
}
