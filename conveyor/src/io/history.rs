//! Append-only loop history (`<log_dir>/history/<prefix>.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::convergence::HistoryEntry;

#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(log_dir: &Path, prefix: &str) -> Self {
        Self {
            path: log_dir.join("history").join(format!("{prefix}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded entries, oldest first. A missing file is an empty history.
    pub fn read(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read history {}", self.path.display()))?;
        let mut entries = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    err = %err,
                    "skipping unreadable history line"
                ),
            }
        }
        Ok(entries)
    }

    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create history dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serialize history entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open history {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append history {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Finding;

    #[test]
    fn appends_and_reads_in_order_skipping_corrupt_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = HistoryLog::new(temp.path(), "review");
        assert!(log.read().expect("empty").is_empty());

        for iteration in 1..=2 {
            log.append(&HistoryEntry {
                iteration,
                findings: vec![Finding::new(format!("finding {iteration}"))],
                verdict: "changes_requested".to_string(),
                signature: None,
            })
            .expect("append");
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        file.write_all(b"{not json\n").expect("corrupt");

        let entries = log.read().expect("read");
        let iterations: Vec<u32> = entries.iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![1, 2]);
        assert!(log.path().ends_with("history/review.jsonl"));
    }
}
