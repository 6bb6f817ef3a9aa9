//! Pull request review loop. Fixes are pushed so the next review sees them.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::convergence::ConvergencePolicy;
use crate::core::types::{Finding, LoopKind, StageKind};
use crate::io::config::ConveyorConfig;
use crate::io::prompt::PromptContext;
use crate::stage::Stage;

use super::{Evaluation, LoopBody, LoopEnv, dispatch_fix, fix_context, judge, run_required};

#[derive(Debug, Default)]
pub struct ReviewLoop;

impl LoopBody for ReviewLoop {
    fn kind(&self) -> LoopKind {
        LoopKind::Review
    }

    fn history_prefix(&self) -> String {
        "review".to_string()
    }

    fn convergence(&self, config: &ConveyorConfig) -> ConvergencePolicy {
        ConvergencePolicy::RepeatRatio {
            threshold: config.loops.repeat_ratio_threshold,
        }
    }

    fn evaluate(&mut self, env: &LoopEnv<'_>, iteration: u32) -> Result<Evaluation> {
        let ctx = PromptContext {
            iteration,
            ..env.base.clone()
        };
        let review = Stage::new(StageKind::PrReview, env.instruction(StageKind::PrReview, &ctx)?);
        Ok(match run_required(env, review)? {
            Some(payload) => judge(&payload),
            None => Evaluation::TimedOut,
        })
    }

    fn fix(
        &mut self,
        env: &LoopEnv<'_>,
        iteration: u32,
        current: &[Finding],
        cumulative: &[Finding],
    ) -> Result<()> {
        let ctx = fix_context(env, LoopKind::Review, iteration, current, cumulative);
        let stage = Stage::new(StageKind::ReviewFix, env.instruction(StageKind::ReviewFix, &ctx)?);
        dispatch_fix(env, stage)?;

        let branch = env.feature_branch();
        env.git
            .push(&env.config.git.remote, branch)
            .with_context(|| format!("push review fixes on {branch}"))?;
        debug!(branch, "review fixes pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::tests::Harness;
    use crate::refine::{IterationCapExceeded, LoopOutcome};
    use crate::test_support::{ScriptedReply, commit_file_in};
    use std::process::Command;

    fn remote_has_branch(h: &Harness, branch: &str) -> bool {
        let out = Command::new("git")
            .args(["ls-remote", "--heads", "origin", branch])
            .current_dir(h.repo.root())
            .output()
            .expect("ls-remote");
        !String::from_utf8_lossy(&out.stdout).trim().is_empty()
    }

    #[test]
    fn fixes_are_pushed_before_rereview() {
        let h = Harness::with_replies(Vec::new());
        let root = h.repo.root().to_path_buf();
        let h = Harness {
            executor: crate::test_support::ScriptedExecutor::new(vec![
                ScriptedReply::review("changes_requested", &["handle empty password"]),
                ScriptedReply::effect(move |_| {
                    commit_file_in(&root, "src/login.rs", "fn login() {}\n").expect("commit");
                    ScriptedReply::success("fixed")
                }),
                ScriptedReply::review("approved", &[]),
            ]),
            ..h
        };
        let outcome = h.run(&mut ReviewLoop, 3).expect("loop");
        assert_eq!(outcome, LoopOutcome::Approved { iterations: 2 });
        assert!(remote_has_branch(&h, "conveyor/issue-1"));
        assert_eq!(
            h.executor.labels(),
            vec!["pr_review", "review_fix", "pr_review"]
        );
    }

    #[test]
    fn review_timeout_dispatches_no_fix() {
        let h = Harness::with_replies(vec![ScriptedReply::Timeout, ScriptedReply::Timeout]);
        let err = h.run(&mut ReviewLoop, 2).expect_err("cap");
        assert!(err.downcast_ref::<IterationCapExceeded>().is_some());
        assert_eq!(h.executor.labels(), vec!["pr_review", "pr_review"]);
        assert!(!remote_has_branch(&h, "conveyor/issue-1"));
    }
}
