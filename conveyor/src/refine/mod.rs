//! Generic refinement loop: evaluate, record, check convergence, fix, repeat.
//!
//! The driver owns counters, history and the stop conditions. A [`LoopBody`]
//! supplies the stage sequence, verdict interpretation and fix dispatch for
//! one loop kind ([`quality`], [`test_loop`], [`review`]).

pub mod quality;
pub mod review;
pub mod test_loop;

use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::convergence::{
    ConvergencePolicy, ConvergenceSignal, HistoryEntry, cumulative_findings, evaluate,
};
use crate::core::types::{Finding, LoopKind, StageKind, Verdict};
use crate::io::config::ConveyorConfig;
use crate::io::git::Git;
use crate::io::history::HistoryLog;
use crate::io::prompt::{PromptContext, PromptEngine};
use crate::io::state_store::StateStore;
use crate::stage::{Stage, StageResult, StageRunner, findings_of, verdict_of};

/// A loop ran out of iterations. Ends the run as `iteration_cap_exceeded`.
#[derive(Debug, Clone, Error)]
#[error("{kind} loop exceeded its cap of {cap} iterations")]
pub struct IterationCapExceeded {
    pub kind: LoopKind,
    pub cap: u32,
}

/// The same test failures kept coming back. Ends the run as `test_convergence_failure`.
#[derive(Debug, Clone, Error)]
#[error("test failures repeated {occurrences} times without progress (signature {signature})")]
pub struct TestConvergenceFailure {
    pub signature: String,
    pub occurrences: u32,
}

/// HEAD moved off the feature branch before a fix stage.
#[derive(Debug, Clone, Error)]
#[error("expected branch '{expected}' before fix, found '{actual}'")]
pub struct BranchMismatch {
    pub expected: String,
    pub actual: String,
}

/// Shared handles for one loop invocation.
pub struct LoopEnv<'a> {
    pub store: &'a StateStore,
    pub runner: &'a StageRunner<'a>,
    pub prompts: &'a PromptEngine,
    pub git: &'a Git,
    pub config: &'a ConveyorConfig,
    /// Template context with issue, branches and PR filled in.
    pub base: &'a PromptContext,
    pub log_dir: PathBuf,
}

impl LoopEnv<'_> {
    /// Run one stage through the shared runner.
    pub fn run_stage(&self, stage: Stage) -> StageResult {
        self.runner.run(&stage)
    }

    pub fn instruction(&self, kind: StageKind, ctx: &PromptContext) -> Result<String> {
        self.prompts.render(kind, ctx)
    }

    pub fn feature_branch(&self) -> &str {
        &self.base.feature_branch
    }
}

/// What one evaluation pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// A stage in the sequence timed out; no verdict this iteration.
    TimedOut,
    Approved {
        verdict: String,
        findings: Vec<Finding>,
    },
    ChangesRequested {
        verdict: String,
        findings: Vec<Finding>,
        signature: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Approved { iterations: u32 },
    /// Findings kept repeating; treated as approved.
    ConvergedWithWarning { iterations: u32 },
}

pub trait LoopBody {
    fn kind(&self) -> LoopKind;

    /// History file stem under `<log_dir>/history/`.
    fn history_prefix(&self) -> String;

    fn convergence(&self, config: &ConveyorConfig) -> ConvergencePolicy;

    fn evaluate(&mut self, env: &LoopEnv<'_>, iteration: u32) -> Result<Evaluation>;

    fn fix(
        &mut self,
        env: &LoopEnv<'_>,
        iteration: u32,
        current: &[Finding],
        cumulative: &[Finding],
    ) -> Result<()>;
}

/// Drive `body` until it is approved, converges, or exceeds `cap`.
///
/// Errors carrying [`IterationCapExceeded`], [`TestConvergenceFailure`],
/// [`BranchMismatch`] or [`crate::stage::StageFailed`] end the whole run.
#[instrument(skip_all, fields(kind = %body.kind(), cap))]
pub fn run_refinement_loop(
    env: &LoopEnv<'_>,
    body: &mut dyn LoopBody,
    cap: u32,
) -> Result<LoopOutcome> {
    let kind = body.kind();
    let history = HistoryLog::new(&env.log_dir, &body.history_prefix());
    let policy = body.convergence(env.config);
    let mut local = 0u32;

    loop {
        local += 1;
        let run = env.store.transform(|run| {
            run.bump_iteration(kind);
            Ok(())
        })?;
        let iteration = run.iterations.get(kind);
        if local > cap {
            warn!(local, iteration, "iteration cap exceeded");
            return Err(IterationCapExceeded { kind, cap }.into());
        }
        info!(local, iteration, "starting iteration");

        let (entry, approved) = match body.evaluate(env, iteration)? {
            Evaluation::TimedOut => {
                warn!(iteration, "stage timed out, skipping verdict");
                continue;
            }
            Evaluation::Approved { verdict, findings } => (
                HistoryEntry {
                    iteration,
                    findings,
                    verdict,
                    signature: None,
                },
                true,
            ),
            Evaluation::ChangesRequested {
                verdict,
                findings,
                signature,
            } => (
                HistoryEntry {
                    iteration,
                    findings,
                    verdict,
                    signature,
                },
                false,
            ),
        };

        let prior = history.read()?;
        history.append(&entry)?;
        if approved {
            info!(iteration, verdict = %entry.verdict, "loop approved");
            return Ok(LoopOutcome::Approved { iterations: local });
        }

        match evaluate(policy, &entry, &prior) {
            ConvergenceSignal::Continue => {}
            ConvergenceSignal::Converged => {
                warn!(
                    iteration,
                    findings = entry.findings.len(),
                    "findings are repeating, accepting with warning"
                );
                return Ok(LoopOutcome::ConvergedWithWarning { iterations: local });
            }
            ConvergenceSignal::Stuck {
                signature,
                occurrences,
            } => {
                warn!(iteration, %signature, occurrences, "test failures are not converging");
                return Err(TestConvergenceFailure {
                    signature,
                    occurrences,
                }
                .into());
            }
        }

        verify_branch(env)?;
        let cumulative = cumulative_findings(&prior);
        body.fix(env, iteration, &entry.findings, &cumulative)?;
    }
}

/// HEAD must be the feature branch before a fix stage runs.
fn verify_branch(env: &LoopEnv<'_>) -> Result<()> {
    let expected = env.feature_branch();
    let actual = env.git.current_branch()?;
    if actual == expected {
        return Ok(());
    }
    if env.config.git.enforce_branch_before_fix {
        return Err(BranchMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    warn!(expected, %actual, "fixing on unexpected branch");
    Ok(())
}

/// Run a fix stage. A timed-out fix is left for the next evaluation to judge.
pub(crate) fn dispatch_fix(env: &LoopEnv<'_>, stage: Stage) -> Result<()> {
    let label = stage.label.clone();
    let result = env.run_stage(stage);
    if result.is_timeout() {
        warn!(stage = %label, "fix stage timed out");
        return Ok(());
    }
    result.into_payload(&label)?;
    Ok(())
}

/// Prompt context for a fix stage.
pub(crate) fn fix_context(
    env: &LoopEnv<'_>,
    kind: LoopKind,
    iteration: u32,
    current: &[Finding],
    cumulative: &[Finding],
) -> PromptContext {
    PromptContext {
        iteration,
        loop_kind: Some(kind.to_string()),
        findings: current.to_vec(),
        cumulative: cumulative.to_vec(),
        ..env.base.clone()
    }
}

/// Interpret a review-style payload.
///
/// A missing or unknown verdict is inferred from the findings: any finding
/// means changes were requested.
pub(crate) fn judge(payload: &serde_json::Value) -> Evaluation {
    let findings = findings_of(payload);
    let verdict = match verdict_of(payload) {
        Some(verdict) => verdict,
        None => {
            let inferred = if findings.is_empty() {
                Verdict::Approved
            } else {
                Verdict::ChangesRequested
            };
            warn!(verdict = inferred.as_str(), "payload has no verdict, inferring from findings");
            inferred
        }
    };
    if verdict.is_positive() {
        Evaluation::Approved {
            verdict: verdict.as_str().to_string(),
            findings,
        }
    } else {
        Evaluation::ChangesRequested {
            verdict: verdict.as_str().to_string(),
            findings,
            signature: None,
        }
    }
}

/// Run a stage whose failure (other than a timeout) ends the run.
pub(crate) fn run_required(env: &LoopEnv<'_>, stage: Stage) -> Result<Option<serde_json::Value>> {
    let label = stage.label.clone();
    let result = env.run_stage(stage);
    if result.is_timeout() {
        return Ok(None);
    }
    Ok(Some(result.into_payload(&label)?))
}
