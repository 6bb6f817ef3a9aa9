//! The persisted workflow document and its pure transforms.
//!
//! Every mutation of a run goes through one of the methods here, applied by
//! the state store inside a read/transform/replace cycle. Methods never touch
//! the filesystem and take the current time as an argument so they stay
//! deterministic under test.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{ChangeScope, LoopKind, StageName, StageStatus, Task, TaskStatus};

/// Violations of the workflow state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    #[error("cannot start stage {requested}: stage {running} is still in progress")]
    AnotherStageInProgress {
        running: StageName,
        requested: StageName,
    },
    #[error("stage {0} is already completed and cannot be re-entered")]
    StageAlreadyCompleted(StageName),
    #[error("stage {0} is not in progress")]
    StageNotInProgress(StageName),
    #[error("feature branch already assigned as '{existing}' (refusing '{requested}')")]
    BranchAlreadyAssigned { existing: String, requested: String },
    #[error("task {0} not found")]
    TaskNotFound(u32),
    #[error("task {0} is already finished")]
    TaskFinished(u32),
    #[error("state document is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("run {0} is already completed")]
    AlreadyCompleted(String),
}

/// Overall lifecycle status of a run. Everything except `InProgress` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    InProgress,
    Completed,
    StageFailed,
    IterationCapExceeded,
    TestConvergenceFailure,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != RunStatus::InProgress
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::StageFailed => "stage_failed",
            RunStatus::IterationCapExceeded => "iteration_cap_exceeded",
            RunStatus::TestConvergenceFailure => "test_convergence_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Global iteration counters, monotonic across every loop invocation in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IterationCounters {
    pub quality: u32,
    pub test: u32,
    pub review: u32,
}

impl IterationCounters {
    pub fn get(&self, kind: LoopKind) -> u32 {
        match kind {
            LoopKind::Quality => self.quality,
            LoopKind::Test => self.test,
            LoopKind::Review => self.review,
        }
    }

    fn slot(&mut self, kind: LoopKind) -> &mut u32 {
        match kind {
            LoopKind::Quality => &mut self.quality,
            LoopKind::Test => &mut self.test,
            LoopKind::Review => &mut self.review,
        }
    }
}

/// One end-to-end attempt at an issue (`state.json`, mirrored as `status.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub issue: String,
    pub base_branch: String,
    /// Assigned once at intake, then immutable.
    #[serde(default)]
    pub feature_branch: Option<String>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub current_stage: Option<StageName>,
    #[serde(default)]
    pub stages: BTreeMap<StageName, StageRecord>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub iterations: IterationCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_scope: Option<ChangeScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub log_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        run_id: impl Into<String>,
        issue: impl Into<String>,
        base_branch: impl Into<String>,
        log_dir: impl Into<PathBuf>,
        now: DateTime<Utc>,
    ) -> Self {
        let stages = StageName::ALL
            .iter()
            .map(|name| (*name, StageRecord::default()))
            .collect();
        Self {
            run_id: run_id.into(),
            issue: issue.into(),
            base_branch: base_branch.into(),
            feature_branch: None,
            status: RunStatus::InProgress,
            failure_reason: None,
            current_stage: None,
            stages,
            tasks: Vec::new(),
            iterations: IterationCounters::default(),
            change_scope: None,
            pr_url: None,
            log_dir: log_dir.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, name: StageName) -> StageStatus {
        self.stages
            .get(&name)
            .map(|record| record.status)
            .unwrap_or_default()
    }

    /// The single "already past this point" predicate used by resume.
    pub fn is_completed(&self, name: StageName) -> bool {
        self.stage_status(name) == StageStatus::Completed
    }

    pub fn in_progress_stage(&self) -> Option<StageName> {
        self.stages
            .iter()
            .find(|(_, record)| record.status == StageStatus::InProgress)
            .map(|(name, _)| *name)
    }

    /// Mark `name` in progress. Re-entering a stage left in progress by a crash is allowed.
    pub fn start_stage(&mut self, name: StageName, now: DateTime<Utc>) -> Result<(), WorkflowError> {
        if self.is_completed(name) {
            return Err(WorkflowError::StageAlreadyCompleted(name));
        }
        if let Some(running) = self.in_progress_stage()
            && running != name
        {
            return Err(WorkflowError::AnotherStageInProgress {
                running,
                requested: name,
            });
        }
        let record = self.stages.entry(name).or_default();
        record.status = StageStatus::InProgress;
        record.started_at = Some(now);
        record.ended_at = None;
        self.current_stage = Some(name);
        Ok(())
    }

    pub fn complete_stage(
        &mut self,
        name: StageName,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let record = self.stages.entry(name).or_default();
        if record.status != StageStatus::InProgress {
            return Err(WorkflowError::StageNotInProgress(name));
        }
        record.status = StageStatus::Completed;
        record.ended_at = Some(now);
        self.current_stage = None;
        Ok(())
    }

    pub fn assign_feature_branch(&mut self, branch: &str) -> Result<(), WorkflowError> {
        match &self.feature_branch {
            Some(existing) if existing != branch => Err(WorkflowError::BranchAlreadyAssigned {
                existing: existing.clone(),
                requested: branch.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.feature_branch = Some(branch.to_string());
                Ok(())
            }
        }
    }

    /// Increment the global counter for `kind` and return the new value.
    pub fn bump_iteration(&mut self, kind: LoopKind) -> u32 {
        let slot = self.iterations.slot(kind);
        *slot += 1;
        *slot
    }

    pub fn task(&self, id: u32) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Apply `update` to an unfinished task.
    pub fn update_task<F: FnOnce(&mut Task)>(
        &mut self,
        id: u32,
        update: F,
    ) -> Result<(), WorkflowError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(WorkflowError::TaskNotFound(id))?;
        if task.is_finished() {
            return Err(WorkflowError::TaskFinished(id));
        }
        update(task);
        Ok(())
    }

    /// Ids of tasks that still need work, in task order.
    pub fn open_task_ids(&self) -> Vec<u32> {
        self.tasks
            .iter()
            .filter(|task| task.status != TaskStatus::Completed)
            .map(|task| task.id)
            .collect()
    }

    /// Record a terminal status. A failed run keeps its in-progress stage so
    /// operators can see where it stopped.
    pub fn mark_terminal(&mut self, status: RunStatus, reason: Option<String>) {
        self.status = status;
        self.failure_reason = reason;
        if status == RunStatus::Completed {
            self.current_stage = None;
        }
    }

    /// Check that a persisted document can be resumed.
    pub fn validate_for_resume(&self) -> Result<(), WorkflowError> {
        if self.run_id.trim().is_empty() {
            return Err(WorkflowError::MissingField("run_id"));
        }
        if self.issue.trim().is_empty() {
            return Err(WorkflowError::MissingField("issue"));
        }
        if self.base_branch.trim().is_empty() {
            return Err(WorkflowError::MissingField("base_branch"));
        }
        if self.log_dir.as_os_str().is_empty() {
            return Err(WorkflowError::MissingField("log_dir"));
        }
        if self.status == RunStatus::Completed {
            return Err(WorkflowError::AlreadyCompleted(self.run_id.clone()));
        }
        Ok(())
    }

    /// Put a previously failed run back in flight for resume.
    pub fn reopen(&mut self) {
        self.status = RunStatus::InProgress;
        self.failure_reason = None;
    }
}
