//! Workflow State Store.
//!
//! The single owner of the persisted [`WorkflowRun`]. Every mutation is a
//! whole-document cycle: read, apply a pure transform, atomically replace the
//! primary file, then mirror the result to `<log_dir>/status.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::core::workflow::WorkflowRun;

/// File name of the status mirror inside a run's log directory.
pub const STATUS_MIRROR: &str = "status.json";

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<WorkflowRun> {
        read_document(&self.path)
    }

    /// Replace the primary document and refresh the mirror.
    #[instrument(skip_all, fields(run_id = %run.run_id))]
    pub fn write(&self, run: &WorkflowRun) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(run).context("serialize workflow state")?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)
            .with_context(|| format!("write state {}", self.path.display()))?;
        debug!(path = %self.path.display(), status = run.status.as_str(), "state written");

        let mirror = run.log_dir.join(STATUS_MIRROR);
        if let Err(err) = super::write_atomic(&mirror, &buf) {
            warn!(path = %mirror.display(), err = %format!("{err:#}"), "failed to mirror status");
        }
        Ok(())
    }

    /// Read, apply `apply`, stamp `updated_at`, and write back.
    ///
    /// Nothing is written when `apply` fails.
    pub fn transform<F>(&self, apply: F) -> Result<WorkflowRun>
    where
        F: FnOnce(&mut WorkflowRun) -> Result<()>,
    {
        let mut run = self.read()?;
        apply(&mut run)?;
        run.updated_at = Utc::now();
        self.write(&run)?;
        Ok(run)
    }

    /// Copy a mirrored `status.json` into the primary location.
    #[instrument(skip_all, fields(from = %seed.display()))]
    pub fn seed_from(&self, seed: &Path) -> Result<WorkflowRun> {
        let run = read_document(seed)?;
        self.write(&run)?;
        debug!(run_id = %run.run_id, "state seeded from mirror");
        Ok(run)
    }
}

fn read_document(path: &Path) -> Result<WorkflowRun> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read state {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse state {}", path.display()))
}
