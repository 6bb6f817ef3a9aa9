//! Test loop: run the suite, check coverage when green, fix attributable failures.

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::core::convergence::{ConvergencePolicy, failure_signature};
use crate::core::failures::attributable_failures;
use crate::core::types::{Finding, LoopKind, StageKind, Verdict};
use crate::io::config::ConveyorConfig;
use crate::io::prompt::PromptContext;
use crate::stage::{Stage, failures_of, verdict_of};

use super::{Evaluation, LoopBody, LoopEnv, dispatch_fix, fix_context, judge, run_required};

#[derive(Debug, Default)]
pub struct TestLoop;

impl TestLoop {
    fn judge_failures(&self, env: &LoopEnv<'_>, payload: &Value) -> Result<Evaluation> {
        let failures = failures_of(payload);
        let changed = env.git.changed_files_since(&env.base.base_branch)?;
        let attributable = attributable_failures(&failures, &changed);
        if attributable.is_empty() {
            info!(
                reported = failures.len(),
                "no failures touch files changed on this branch"
            );
            return Ok(Evaluation::Approved {
                verdict: Verdict::Failed.as_str().to_string(),
                findings: Vec::new(),
            });
        }
        info!(
            reported = failures.len(),
            attributable = attributable.len(),
            "tests failing"
        );
        Ok(Evaluation::ChangesRequested {
            verdict: Verdict::Failed.as_str().to_string(),
            findings: attributable.iter().map(|f| f.to_finding()).collect(),
            signature: Some(failure_signature(&attributable)),
        })
    }
}

impl LoopBody for TestLoop {
    fn kind(&self) -> LoopKind {
        LoopKind::Test
    }

    fn history_prefix(&self) -> String {
        "test".to_string()
    }

    fn convergence(&self, config: &ConveyorConfig) -> ConvergencePolicy {
        ConvergencePolicy::FailureSignature {
            max_repeats: config.loops.signature_repeat_limit,
        }
    }

    fn evaluate(&mut self, env: &LoopEnv<'_>, iteration: u32) -> Result<Evaluation> {
        let ctx = PromptContext {
            iteration,
            ..env.base.clone()
        };
        let run_tests = Stage::new(
            StageKind::RunTests,
            env.instruction(StageKind::RunTests, &ctx)?,
        );
        let Some(payload) = run_required(env, run_tests)? else {
            return Ok(Evaluation::TimedOut);
        };

        let passed = match verdict_of(&payload) {
            Some(verdict) => verdict.is_positive(),
            None => {
                let inferred = failures_of(&payload).is_empty();
                warn!(passed = inferred, "test run has no verdict, inferring from failures");
                inferred
            }
        };
        if !passed {
            return self.judge_failures(env, &payload);
        }

        let validate = Stage::new(
            StageKind::TestValidate,
            env.instruction(StageKind::TestValidate, &ctx)?,
        );
        Ok(match run_required(env, validate)? {
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
        let ctx = fix_context(env, LoopKind::Test, iteration, current, cumulative);
        let stage = Stage::new(StageKind::TestFix, env.instruction(StageKind::TestFix, &ctx)?);
        dispatch_fix(env, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::tests::Harness;
    use crate::refine::{LoopOutcome, TestConvergenceFailure};
    use crate::test_support::ScriptedReply;
    use serde_json::json;

    fn failing(tests: &[(&str, &str)]) -> ScriptedReply {
        let failures: Vec<Value> = tests
            .iter()
            .map(|(name, file)| json!({"name": name, "file": file, "message": "assertion failed"}))
            .collect();
        ScriptedReply::structured(json!({
            "status": "success",
            "verdict": "failed",
            "failures": failures,
        }))
    }

    fn passing() -> ScriptedReply {
        ScriptedReply::structured(json!({"status": "success", "verdict": "passed", "failures": []}))
    }

    fn harness(replies: Vec<ScriptedReply>) -> Harness {
        let h = Harness::with_replies(replies);
        h.repo
            .commit_file("tests/login_test.rs", "#[test] fn login() {}\n")
            .expect("commit");
        h
    }

    #[test]
    fn green_and_comprehensive_needs_one_iteration() {
        let h = harness(vec![passing(), ScriptedReply::review("approved", &[])]);
        let outcome = h.run(&mut TestLoop, 5).expect("loop");
        assert_eq!(outcome, LoopOutcome::Approved { iterations: 1 });
        assert_eq!(h.executor.labels(), vec!["run_tests", "test_validate"]);
    }

    #[test]
    fn failures_outside_the_branch_are_ignored() {
        let h = harness(vec![failing(&[("legacy", "tests/legacy_test.rs")])]);
        let outcome = h.run(&mut TestLoop, 5).expect("loop");
        assert_eq!(outcome, LoopOutcome::Approved { iterations: 1 });
        assert_eq!(h.executor.labels(), vec!["run_tests"]);
    }

    #[test]
    fn attributable_failure_is_fixed() {
        let h = harness(vec![
            failing(&[("login", "./tests/login_test.rs"), ("legacy", "tests/legacy_test.rs")]),
            ScriptedReply::success("fixed"),
            passing(),
            ScriptedReply::review("passed", &[]),
        ]);
        h.run(&mut TestLoop, 5).expect("loop");
        let fix = &h.executor.requests()[1];
        assert_eq!(fix.label, "test_fix");
        assert!(fix.instruction.contains("test login failed"));
        assert!(!fix.instruction.contains("legacy"));
    }

    #[test]
    fn incomplete_coverage_requests_test_fix() {
        let h = harness(vec![
            passing(),
            ScriptedReply::review("changes_requested", &["no test for lockout"]),
            ScriptedReply::success("added test"),
            passing(),
            ScriptedReply::review("approved", &[]),
        ]);
        let outcome = h.run(&mut TestLoop, 5).expect("loop");
        assert_eq!(outcome, LoopOutcome::Approved { iterations: 2 });
        assert!(h.executor.requests()[2].instruction.contains("- no test for lockout"));
    }

    #[test]
    fn same_failures_three_times_abort() {
        let failure = || failing(&[("login", "tests/login_test.rs")]);
        let h = harness(vec![
            failure(),
            ScriptedReply::success("tried"),
            failure(),
            ScriptedReply::success("tried again"),
            failure(),
        ]);
        let err = h.run(&mut TestLoop, 5).expect_err("stuck");
        let stuck = err
            .downcast_ref::<TestConvergenceFailure>()
            .expect("convergence failure");
        assert_eq!(stuck.occurrences, 3);
        assert_eq!(h.executor.remaining(), 0);
    }
}
