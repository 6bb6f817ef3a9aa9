//! Per-task code-quality loop: simplify, review, fix.

use anyhow::Result;

use crate::core::convergence::ConvergencePolicy;
use crate::core::types::{Finding, LoopKind, StageKind, Task};
use crate::io::config::ConveyorConfig;
use crate::io::prompt::PromptContext;
use crate::stage::Stage;

use super::{Evaluation, LoopBody, LoopEnv, dispatch_fix, fix_context, judge, run_required};

pub struct QualityLoop {
    task: Task,
}

impl QualityLoop {
    pub fn new(task: Task) -> Self {
        Self { task }
    }

    fn suffix(&self) -> String {
        format!("task-{}", self.task.id)
    }

    fn context(&self, env: &LoopEnv<'_>, iteration: u32) -> PromptContext {
        PromptContext {
            task: Some(self.task.clone()),
            iteration,
            ..env.base.clone()
        }
    }
}

impl LoopBody for QualityLoop {
    fn kind(&self) -> LoopKind {
        LoopKind::Quality
    }

    fn history_prefix(&self) -> String {
        format!("quality-{}", self.suffix())
    }

    fn convergence(&self, config: &ConveyorConfig) -> ConvergencePolicy {
        ConvergencePolicy::RepeatRatio {
            threshold: config.loops.repeat_ratio_threshold,
        }
    }

    fn evaluate(&mut self, env: &LoopEnv<'_>, iteration: u32) -> Result<Evaluation> {
        let ctx = self.context(env, iteration);
        let suffix = self.suffix();

        let simplify = Stage::new(
            StageKind::Simplify,
            env.instruction(StageKind::Simplify, &ctx)?,
        )
        .labelled(&suffix);
        if run_required(env, simplify)?.is_none() {
            return Ok(Evaluation::TimedOut);
        }

        let review = Stage::new(
            StageKind::QualityReview,
            env.instruction(StageKind::QualityReview, &ctx)?,
        )
        .labelled(&suffix);
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
        let ctx = PromptContext {
            task: Some(self.task.clone()),
            ..fix_context(env, LoopKind::Quality, iteration, current, cumulative)
        };
        let stage = Stage::new(StageKind::QualityFix, env.instruction(StageKind::QualityFix, &ctx)?)
            .labelled(&self.suffix())
            .with_agent(self.task.agent.clone());
        dispatch_fix(env, stage)
    }
}
