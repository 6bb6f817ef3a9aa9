//! Run Controller: sequences the fixed stage pipeline for one issue.
//!
//! Each pipeline stage is bracketed by `start_stage` / `complete_stage`
//! transforms on the persisted run, so a relaunch skips everything already
//! completed and re-enters the stage that was in flight. Every exit path ends
//! in an explicit terminal-state write and a [`RunOutcome`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::intake::{RawTask, extract_size_marker, normalize_tasks, task_size};
use crate::core::iteration_cap::{max_iterations, max_review_attempts};
use crate::core::scope::classify_paths;
use crate::core::types::{ChangeScope, StageKind, StageName, Task, TaskStatus};
use crate::core::workflow::{RunStatus, WorkflowRun};
use crate::exit_codes;
use crate::io::config::{ConveyorConfig, PathConfig};
use crate::io::executor::Executor;
use crate::io::git::Git;
use crate::io::prompt::{IssueContext, PromptContext, PromptEngine};
use crate::io::schemas::ensure_schemas;
use crate::io::sleeper::Sleeper;
use crate::io::state_store::StateStore;
use crate::io::tracker::{Issue, IssueTracker, notify};
use crate::io::write_atomic;
use crate::refine::quality::QualityLoop;
use crate::refine::review::ReviewLoop;
use crate::refine::test_loop::TestLoop;
use crate::refine::{
    IterationCapExceeded, LoopBody, LoopEnv, LoopOutcome, TestConvergenceFailure,
    run_refinement_loop,
};
use crate::stage::{
    Stage, StageErrorKind, StageFailed, StageResult, StageRunner, list_of, summary_of,
};

/// Cached issue snapshot inside the run's log directory.
pub const ISSUE_FILE: &str = "issue.json";
const ISSUE_MARKDOWN: &str = "issue.md";

/// The persisted document cannot be resumed.
#[derive(Debug, Clone, Error)]
#[error("cannot resume run: {reason}")]
pub struct ResumeRejected {
    pub reason: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        run_id: String,
    },
    Failed {
        run_id: String,
        status: RunStatus,
        reason: String,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &str {
        match self {
            RunOutcome::Completed { run_id } | RunOutcome::Failed { run_id, .. } => run_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed { .. } => exit_codes::OK,
            RunOutcome::Failed {
                status: RunStatus::IterationCapExceeded | RunStatus::TestConvergenceFailure,
                ..
            } => exit_codes::CAP_EXCEEDED,
            RunOutcome::Failed { .. } => exit_codes::FAILED,
        }
    }
}

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub executor: &'a dyn Executor,
    pub tracker: &'a dyn IssueTracker,
    pub sleeper: &'a dyn Sleeper,
}

pub struct Controller<'a> {
    root: PathBuf,
    config: ConveyorConfig,
    paths: PathConfig,
    services: Services<'a>,
    quiet: bool,
    prompts: PromptEngine,
    store: StateStore,
    git: Git,
}

impl<'a> Controller<'a> {
    pub fn new(root: &Path, config: ConveyorConfig, services: Services<'a>) -> Self {
        let paths = config.paths.resolve(root);
        Self {
            root: root.to_path_buf(),
            quiet: config.tracker.quiet,
            store: StateStore::new(&paths.state_file),
            git: Git::new(root),
            prompts: PromptEngine::new(),
            paths,
            config,
            services,
        }
    }

    /// Suppress progress comments in addition to `tracker.quiet`.
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet |= quiet;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a fresh run for `issue`, branching from `base` (default: the current branch).
    #[instrument(skip_all, fields(issue))]
    pub fn start_run(&self, issue: &str, base: Option<&str>) -> Result<RunOutcome> {
        if self.store.exists() {
            let existing = self.store.read()?;
            if existing.status == RunStatus::InProgress {
                return Err(anyhow!(
                    "run {} for issue {} is still in progress; resume it or remove {}",
                    existing.run_id,
                    existing.issue,
                    self.store.path().display()
                ));
            }
        }
        ensure_schemas(&self.paths.schema_dir, false)?;

        let base = match base {
            Some(base) => base.to_string(),
            None => self.git.current_branch().context("determine base branch")?,
        };
        let now = Utc::now();
        let run_id = format!("{issue}-{}", now.format("%Y%m%d%H%M%S"));
        let log_dir = self.paths.log_root.join(&run_id);
        let run = WorkflowRun::new(&run_id, issue, &base, log_dir, now);
        self.store.write(&run)?;
        info!(run_id = %run_id, base = %base, "run started");
        self.drive()
    }

    /// Resume the persisted run, optionally seeding it from a mirrored `status.json`.
    #[instrument(skip_all)]
    pub fn resume_run(&self, from: Option<&Path>) -> Result<RunOutcome> {
        let run = match from {
            Some(seed) => self.store.seed_from(seed)?,
            None => self.store.read().map_err(|err| ResumeRejected {
                reason: format!("{err:#}"),
            })?,
        };
        run.validate_for_resume().map_err(|err| ResumeRejected {
            reason: err.to_string(),
        })?;
        ensure_schemas(&self.paths.schema_dir, false)?;

        let run = if run.status.is_terminal() {
            info!(run_id = %run.run_id, previous = run.status.as_str(), "reopening failed run");
            self.store.transform(|run| {
                run.reopen();
                Ok(())
            })?
        } else {
            run
        };
        if let Some(branch) = &run.feature_branch {
            self.git
                .ensure_branch(branch, &run.base_branch)
                .with_context(|| format!("check out feature branch {branch}"))?;
        }
        info!(run_id = %run.run_id, stage = ?run.current_stage, "resuming run");
        self.drive()
    }

    fn drive(&self) -> Result<RunOutcome> {
        let run = self.store.read()?;
        let runner = StageRunner::new(
            self.services.executor,
            self.services.sleeper,
            &self.config,
            &self.root,
            &self.paths.schema_dir,
            &run.log_dir,
        );

        for name in StageName::ALL {
            if self.store.read()?.is_completed(name) {
                debug!(stage = %name, "already completed, skipping");
                continue;
            }
            self.store.transform(|run| Ok(run.start_stage(name, Utc::now())?))?;
            info!(stage = %name, "stage started");
            if let Err(err) = self.execute(name, &runner) {
                return self.fail(err);
            }
            self.store
                .transform(|run| Ok(run.complete_stage(name, Utc::now())?))?;
            info!(stage = %name, "stage completed");
            self.comment(&run.issue, &format!("conveyor: stage {name} completed"));
        }

        let run = self.store.transform(|run| {
            run.mark_terminal(RunStatus::Completed, None);
            Ok(())
        })?;
        info!(run_id = %run.run_id, "run completed");
        let message = match &run.pr_url {
            Some(url) => format!("conveyor: run {} completed ({url})", run.run_id),
            None => format!("conveyor: run {} completed", run.run_id),
        };
        self.comment(&run.issue, &message);
        Ok(RunOutcome::Completed { run_id: run.run_id })
    }

    /// Record the terminal state for `err`.
    fn fail(&self, err: anyhow::Error) -> Result<RunOutcome> {
        let status = if err.downcast_ref::<IterationCapExceeded>().is_some() {
            RunStatus::IterationCapExceeded
        } else if err.downcast_ref::<TestConvergenceFailure>().is_some() {
            RunStatus::TestConvergenceFailure
        } else {
            RunStatus::StageFailed
        };
        let reason = format!("{err:#}");
        error!(status = status.as_str(), %reason, "run stopped");
        let run = self.store.transform(|run| {
            run.mark_terminal(status, Some(reason.clone()));
            Ok(())
        })?;
        self.comment(
            &run.issue,
            &format!(
                "conveyor: run {} stopped ({}): {reason}",
                run.run_id,
                status.as_str()
            ),
        );
        Ok(RunOutcome::Failed {
            run_id: run.run_id,
            status,
            reason,
        })
    }

    fn comment(&self, issue: &str, message: &str) {
        notify(self.services.tracker, self.quiet, issue, message);
    }

    fn execute(&self, name: StageName, runner: &StageRunner<'_>) -> Result<()> {
        match name {
            StageName::Intake => self.intake(runner),
            StageName::Validate => self.one_shot(runner, StageKind::ValidatePlan).map(drop),
            StageName::Implement => self.implement(runner),
            StageName::TestLoop => self.test_loop(runner),
            StageName::Docs => self.one_shot(runner, StageKind::Docs).map(drop),
            StageName::Publish => self.publish(runner),
            StageName::ReviewLoop => self.review_loop(runner),
            StageName::Finalize => self.one_shot(runner, StageKind::Finalize).map(drop),
        }
    }

    /// Issue snapshot for `run`, fetched once and cached in the log directory.
    fn load_issue(&self, run: &WorkflowRun) -> Result<Issue> {
        let path = run.log_dir.join(ISSUE_FILE);
        if path.exists() {
            let text =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            return serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()));
        }
        let issue = self
            .services
            .tracker
            .fetch_issue(&run.issue)
            .with_context(|| format!("fetch issue {}", run.issue))?;
        let json = serde_json::to_string_pretty(&issue).context("serialize issue")?;
        write_atomic(&path, &(json + "\n"))?;
        write_atomic(
            &run.log_dir.join(ISSUE_MARKDOWN),
            &format!("# {}\n\n{}\n", issue.title, issue.body.trim()),
        )?;
        debug!(path = %path.display(), "issue cached");
        Ok(issue)
    }

    /// Template context for the current state of the run.
    fn context(&self) -> Result<(WorkflowRun, PromptContext)> {
        let run = self.store.read()?;
        let issue = self.load_issue(&run)?;
        let ctx = PromptContext {
            issue: IssueContext {
                id: run.issue.clone(),
                title: issue.title,
                body: issue.body,
            },
            base_branch: run.base_branch.clone(),
            feature_branch: run.feature_branch.clone().unwrap_or_default(),
            tasks: run.tasks.clone(),
            scope: run.change_scope.map(|scope| scope.as_str().to_string()),
            pr_url: run.pr_url.clone(),
            ..PromptContext::default()
        };
        Ok((run, ctx))
    }

    fn loop_env<'e>(
        &'e self,
        runner: &'e StageRunner<'e>,
        base: &'e PromptContext,
        run: &WorkflowRun,
    ) -> LoopEnv<'e> {
        LoopEnv {
            store: &self.store,
            runner,
            prompts: &self.prompts,
            git: &self.git,
            config: &self.config,
            base,
            log_dir: run.log_dir.clone(),
        }
    }

    fn run_loop(
        &self,
        runner: &StageRunner<'_>,
        body: &mut dyn LoopBody,
        cap: u32,
    ) -> Result<LoopOutcome> {
        let (run, base) = self.context()?;
        let env = self.loop_env(runner, &base, &run);
        let outcome = run_refinement_loop(&env, body, cap)?;
        if let LoopOutcome::ConvergedWithWarning { iterations } = outcome {
            warn!(kind = %body.kind(), iterations, "loop ended on repeating findings");
        }
        Ok(outcome)
    }

    /// Run a single stage whose failure ends the run.
    fn one_shot(&self, runner: &StageRunner<'_>, kind: StageKind) -> Result<Value> {
        let (_, ctx) = self.context()?;
        let stage = Stage::new(kind, self.prompts.render(kind, &ctx)?);
        let label = stage.label.clone();
        let payload = runner.run(&stage).into_payload(&label)?;
        if let Some(summary) = summary_of(&payload) {
            info!(stage = %label, summary, "stage reported");
        }
        Ok(payload)
    }

    fn intake(&self, runner: &StageRunner<'_>) -> Result<()> {
        let run = self.store.read()?;
        let issue = self.load_issue(&run)?;
        let branch = self.config.git.feature_branch(&run.issue);
        self.git
            .ensure_branch(&branch, &run.base_branch)
            .with_context(|| format!("check out feature branch {branch}"))?;
        self.store
            .transform(|run| Ok(run.assign_feature_branch(&branch)?))?;

        let payload = self.one_shot(runner, StageKind::Intake)?;
        let raw: Vec<RawTask> = list_of(&payload, "tasks");
        if raw.is_empty() {
            warn!("intake reported no tasks, falling back to the issue title");
        }
        let tasks = normalize_tasks(raw, &issue.title);
        info!(count = tasks.len(), branch = %branch, "tasks planned");
        self.store.transform(|run| {
            run.tasks = tasks;
            Ok(())
        })?;
        Ok(())
    }

    fn implement(&self, runner: &StageRunner<'_>) -> Result<()> {
        for id in self.store.read()?.open_task_ids() {
            let run = self.store.read()?;
            let task = run
                .task(id)
                .cloned()
                .ok_or_else(|| anyhow!("task {id} disappeared from the run"))?;
            if task.status == TaskStatus::Failed {
                return Err(StageFailed::new(
                    format!("implement-task-{id}"),
                    "task exhausted its attempts in an earlier session; start a new run",
                )
                .into());
            }
            self.implement_task(runner, task)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(task = task.id))]
    fn implement_task(&self, runner: &StageRunner<'_>, task: Task) -> Result<()> {
        let id = task.id;
        if task.status == TaskStatus::Implemented {
            info!("implementation already succeeded, resuming quality loop");
        } else {
            self.implement_attempts(runner, &task)?;
            self.store.transform(|run| {
                Ok(run.update_task(id, |task| task.status = TaskStatus::Implemented)?)
            })?;
        }

        let diff = self.git.diff_line_count(&self.store.read()?.base_branch)?;
        let cap = max_iterations(task_size(&task.description), diff);
        info!(diff_lines = diff, cap, "starting quality loop");
        let current = self
            .store
            .read()?
            .task(id)
            .cloned()
            .ok_or_else(|| anyhow!("task {id} disappeared from the run"))?;
        self.run_loop(runner, &mut QualityLoop::new(current), cap)?;

        self.store
            .transform(|run| Ok(run.update_task(id, |task| task.status = TaskStatus::Completed)?))?;
        info!("task completed");
        Ok(())
    }

    /// Run the implementation stage until it succeeds or the size budget is spent.
    fn implement_attempts(&self, runner: &StageRunner<'_>, task: &Task) -> Result<()> {
        let id = task.id;
        let suffix = format!("task-{id}");
        let max_attempts = max_review_attempts(extract_size_marker(&task.description).as_deref());

        loop {
            let attempts = self
                .store
                .read()?
                .task(id)
                .map(|task| task.review_attempts)
                .unwrap_or_default();
            if attempts >= max_attempts {
                self.store
                    .transform(|run| Ok(run.update_task(id, |task| task.status = TaskStatus::Failed)?))?;
                return Err(StageFailed::new(
                    format!("implement-{suffix}"),
                    format!("no successful implementation after {attempts} attempts"),
                )
                .into());
            }
            let run = self.store.transform(|run| {
                Ok(run.update_task(id, |task| {
                    task.review_attempts += 1;
                    task.status = TaskStatus::InProgress;
                })?)
            })?;
            let task = run
                .task(id)
                .cloned()
                .ok_or_else(|| anyhow!("task {id} disappeared from the run"))?;

            let (_, base) = self.context()?;
            let ctx = PromptContext {
                attempt: task.review_attempts,
                task: Some(task.clone()),
                ..base
            };
            let stage = Stage::new(
                StageKind::Implement,
                self.prompts.render(StageKind::Implement, &ctx)?,
            )
            .labelled(&suffix)
            .with_agent(task.agent.clone());
            let label = stage.label.clone();
            match runner.run(&stage) {
                StageResult::Error {
                    kind: StageErrorKind::SchemaNotFound,
                    message,
                } => return Err(StageFailed::new(label, message).into()),
                result => match result.into_payload(&label) {
                    Ok(_) => return Ok(()),
                    Err(err) => {
                        warn!(attempt = task.review_attempts, max_attempts, %err, "implementation attempt failed");
                    }
                },
            }
        }
    }

    fn test_loop(&self, runner: &StageRunner<'_>) -> Result<()> {
        let run = self.store.read()?;
        let changed = self.git.changed_files_since(&run.base_branch)?;
        let scope = classify_paths(&changed);
        self.store.transform(|run| {
            run.change_scope = Some(scope);
            Ok(())
        })?;
        if scope == ChangeScope::Config {
            info!(files = changed.len(), "config-only change, skipping tests");
            return Ok(());
        }
        info!(scope = scope.as_str(), files = changed.len(), "running test loop");
        self.run_loop(runner, &mut TestLoop, self.config.loops.test_max_iterations)?;
        Ok(())
    }

    fn publish(&self, runner: &StageRunner<'_>) -> Result<()> {
        let run = self.store.read()?;
        let branch = run
            .feature_branch
            .clone()
            .ok_or_else(|| anyhow!("no feature branch assigned"))?;
        self.git
            .push(&self.config.git.remote, &branch)
            .with_context(|| format!("push {branch}"))?;
        let payload = self.one_shot(runner, StageKind::Publish)?;
        match payload.get("pr_url").and_then(Value::as_str) {
            Some(url) if !url.trim().is_empty() => {
                let url = url.trim().to_string();
                info!(pr_url = %url, "pull request published");
                self.store.transform(|run| {
                    run.pr_url = Some(url);
                    Ok(())
                })?;
            }
            _ => warn!("publish stage reported no pr_url"),
        }
        Ok(())
    }

    fn review_loop(&self, runner: &StageRunner<'_>) -> Result<()> {
        let base = self.store.read()?.base_branch;
        let diff = self.git.diff_line_count(&base)?;
        let cap = max_iterations(None, diff);
        info!(diff_lines = diff, cap, "starting review loop");
        self.run_loop(runner, &mut ReviewLoop, cap)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageStatus;
    use crate::test_support::{RecordingSleeper, ScriptedExecutor, ScriptedReply, StaticTracker, TestRepo};
    use serde_json::json;

    fn intake(tasks: &[&str]) -> ScriptedReply {
        let tasks: Vec<Value> = tasks.iter().map(|d| json!({"description": d})).collect();
        ScriptedReply::structured(json!({"status": "success", "tasks": tasks}))
    }

    #[test]
    fn exit_codes_follow_terminal_status() {
        let failed = |status| RunOutcome::Failed {
            run_id: "r".to_string(),
            status,
            reason: String::new(),
        };
        assert_eq!(
            RunOutcome::Completed {
                run_id: "r".to_string()
            }
            .exit_code(),
            exit_codes::OK
        );
        assert_eq!(failed(RunStatus::StageFailed).exit_code(), exit_codes::FAILED);
        assert_eq!(
            failed(RunStatus::IterationCapExceeded).exit_code(),
            exit_codes::CAP_EXCEEDED
        );
        assert_eq!(
            failed(RunStatus::TestConvergenceFailure).exit_code(),
            exit_codes::CAP_EXCEEDED
        );
    }

    #[test]
    fn intake_failure_records_stage_failed() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::new(vec![ScriptedReply::error("model refused")]);
        let tracker = StaticTracker::new("Add login", "Users need to log in.");
        let sleeper = RecordingSleeper::default();
        let controller = Controller::new(
            repo.root(),
            ConveyorConfig::default(),
            Services {
                executor: &executor,
                tracker: &tracker,
                sleeper: &sleeper,
            },
        );
        let outcome = controller.start_run("7", None).expect("run");
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                status: RunStatus::StageFailed,
                ..
            }
        ));
        let run = controller.store().read().expect("state");
        assert_eq!(run.status, RunStatus::StageFailed);
        assert_eq!(run.stage_status(StageName::Intake), StageStatus::InProgress);
        assert_eq!(run.feature_branch.as_deref(), Some("conveyor/issue-7"));
        assert_eq!(repo.current_branch().expect("branch"), "conveyor/issue-7");
        assert!(run.log_dir.join(ISSUE_FILE).exists());
        assert!(tracker.comments().last().expect("comment").contains("stage_failed"));
    }

    #[test]
    fn exhausted_implementation_marks_task_failed() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::new(vec![
            intake(&["**(S)** add login form"]),
            ScriptedReply::success("plan ok"),
            ScriptedReply::Timeout,
        ]);
        let tracker = StaticTracker::new("Add login", "");
        let sleeper = RecordingSleeper::default();
        let controller = Controller::new(
            repo.root(),
            ConveyorConfig::default(),
            Services {
                executor: &executor,
                tracker: &tracker,
                sleeper: &sleeper,
            },
        )
        .with_quiet(true);
        let outcome = controller.start_run("7", Some("main")).expect("run");
        assert_eq!(outcome.exit_code(), exit_codes::FAILED);
        let run = controller.store().read().expect("state");
        assert_eq!(run.tasks[0].status, TaskStatus::Failed);
        assert_eq!(run.tasks[0].review_attempts, 1);
        assert!(tracker.comments().is_empty());
        assert_eq!(executor.remaining(), 0);
    }

    #[test]
    fn refuses_to_start_over_an_active_run() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::new(Vec::new());
        let tracker = StaticTracker::new("Add login", "");
        let sleeper = RecordingSleeper::default();
        let controller = Controller::new(
            repo.root(),
            ConveyorConfig::default(),
            Services {
                executor: &executor,
                tracker: &tracker,
                sleeper: &sleeper,
            },
        );
        let active = WorkflowRun::new("7-x", "7", "main", repo.root().join(".conveyor/runs/7-x"), Utc::now());
        controller.store().write(&active).expect("write");
        let err = controller.start_run("8", None).expect_err("active run");
        assert!(err.to_string().contains("still in progress"));
    }

    #[test]
    fn resume_rejects_completed_runs() {
        let repo = TestRepo::new().expect("repo");
        let executor = ScriptedExecutor::new(Vec::new());
        let tracker = StaticTracker::new("Add login", "");
        let sleeper = RecordingSleeper::default();
        let controller = Controller::new(
            repo.root(),
            ConveyorConfig::default(),
            Services {
                executor: &executor,
                tracker: &tracker,
                sleeper: &sleeper,
            },
        );
        let mut done = WorkflowRun::new("7-x", "7", "main", repo.root().join(".conveyor/runs/7-x"), Utc::now());
        done.mark_terminal(RunStatus::Completed, None);
        controller.store().write(&done).expect("write");
        let err = controller.resume_run(None).expect_err("completed");
        assert!(err.downcast_ref::<ResumeRejected>().is_some());
        assert!(executor.requests().is_empty());
    }
}
