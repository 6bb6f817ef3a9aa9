//! Git adapter.
//!
//! Only the handful of operations the orchestrator needs: branch existence
//! and checkout, the active-branch check, three-dot diffs against the base
//! branch, and push.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Create `branch` at `base` and check it out.
    #[instrument(skip_all, fields(branch, base))]
    pub fn checkout_new_branch_from(&self, branch: &str, base: &str) -> Result<()> {
        debug!(branch, base, "creating feature branch");
        self.run_checked(&["checkout", "-b", branch, base])?;
        Ok(())
    }

    /// Check out `branch`, creating it from `base` when it does not exist yet.
    pub fn ensure_branch(&self, branch: &str, base: &str) -> Result<()> {
        if self.current_branch().ok().as_deref() == Some(branch) {
            return Ok(());
        }
        if self.branch_exists(branch)? {
            self.checkout_branch(branch)
        } else {
            self.checkout_new_branch_from(branch, base)
        }
    }

    /// Paths changed on this branch relative to `base` (`git diff --name-only base...HEAD`).
    #[instrument(skip_all, fields(base))]
    pub fn changed_files_since(&self, base: &str) -> Result<Vec<String>> {
        let range = format!("{base}...HEAD");
        let out = self.run_capture(&["diff", "--name-only", &range])?;
        let files: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        debug!(count = files.len(), "changed files");
        Ok(files)
    }

    /// Inserted plus deleted lines on this branch relative to `base`.
    #[instrument(skip_all, fields(base))]
    pub fn diff_line_count(&self, base: &str) -> Result<u64> {
        let range = format!("{base}...HEAD");
        let out = self.run_capture(&["diff", "--numstat", &range])?;
        let total = parse_numstat(&out)?;
        debug!(total, "diff line count");
        Ok(total)
    }

    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        debug!(remote, branch, "pushing branch");
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Sum `--numstat` columns. Binary files report `-` and count as zero.
fn parse_numstat(out: &str) -> Result<u64> {
    let mut total = 0u64;
    for line in out.lines().filter(|line| !line.trim().is_empty()) {
        let mut cols = line.split('\t');
        for _ in 0..2 {
            let col = cols
                .next()
                .ok_or_else(|| anyhow!("unexpected numstat line: '{line}'"))?;
            if col == "-" {
                continue;
            }
            total += col
                .parse::<u64>()
                .with_context(|| format!("parse numstat line '{line}'"))?;
        }
    }
    Ok(total)
}
