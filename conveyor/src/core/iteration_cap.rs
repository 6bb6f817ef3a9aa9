//! Iteration caps for refinement loops and task implementation retries.
//!
//! Two independent signals bound a loop: the size marker the task was filed
//! with, and how much the branch actually changed. The cap is the smaller of
//! the two so neither a stale label nor a tiny diff can force extra passes.

use tracing::warn;

use crate::core::types::SizeLabel;

/// Cap used when the size label is missing or unrecognized.
pub const DEFAULT_SIZE_CAP: u32 = 3;

/// Size-based cap: S→1, M→2, L→3, anything else→3.
pub fn size_cap(size: Option<SizeLabel>) -> u32 {
    match size {
        Some(SizeLabel::Small) => 1,
        Some(SizeLabel::Medium) => 2,
        Some(SizeLabel::Large) | None => DEFAULT_SIZE_CAP,
    }
}

/// Diff-magnitude cap over inserted+deleted lines: <20→1, <100→2, <300→3, else 5.
pub fn diff_cap(diff_lines: u64) -> u32 {
    match diff_lines {
        0..20 => 1,
        20..100 => 2,
        100..300 => 3,
        _ => 5,
    }
}

/// Maximum iterations for a refinement loop.
pub fn max_iterations(size: Option<SizeLabel>, diff_lines: u64) -> u32 {
    size_cap(size).min(diff_cap(diff_lines))
}

/// Maximum implementation attempts for a task, from its raw size marker.
///
/// Unlike [`size_cap`] this reports labels it cannot interpret instead of
/// defaulting silently.
pub fn max_review_attempts(raw_label: Option<&str>) -> u32 {
    match raw_label {
        None => {
            warn!(
                default = DEFAULT_SIZE_CAP,
                "task has no size marker; using default review attempts"
            );
            DEFAULT_SIZE_CAP
        }
        Some(raw) => match SizeLabel::parse(raw) {
            Some(size) => size_cap(Some(size)),
            None => {
                warn!(
                    label = raw,
                    default = DEFAULT_SIZE_CAP,
                    "unrecognized size marker; using default review attempts"
                );
                DEFAULT_SIZE_CAP
            }
        },
    }
}
