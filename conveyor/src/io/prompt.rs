//! Stage instruction templates.
//!
//! Instructions are short minijinja templates embedded in the binary. The
//! orchestrator fills one [`PromptContext`] per invocation; each template uses
//! only the fields it needs.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

use crate::core::types::{Finding, StageKind, Task};

const TEMPLATES: &[(&str, &str)] = &[
    ("_issue", include_str!("prompts/_issue.md")),
    ("intake", include_str!("prompts/intake.md")),
    ("validate", include_str!("prompts/validate.md")),
    ("implement", include_str!("prompts/implement.md")),
    ("simplify", include_str!("prompts/simplify.md")),
    ("review", include_str!("prompts/review.md")),
    ("pr_review", include_str!("prompts/pr_review.md")),
    ("fix", include_str!("prompts/fix.md")),
    ("run_tests", include_str!("prompts/run_tests.md")),
    ("test_validate", include_str!("prompts/test_validate.md")),
    ("docs", include_str!("prompts/docs.md")),
    ("publish", include_str!("prompts/publish.md")),
    ("finalize", include_str!("prompts/finalize.md")),
];

#[derive(Debug, Clone, Default, Serialize)]
pub struct IssueContext {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// Everything a stage template may reference.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptContext {
    pub issue: IssueContext,
    pub base_branch: String,
    pub feature_branch: String,
    pub tasks: Vec<Task>,
    pub task: Option<Task>,
    /// Implementation attempt for the current task, 1-based.
    pub attempt: u32,
    /// Global iteration of the enclosing loop.
    pub iteration: u32,
    /// Loop kind name for fix stages (`quality`, `test`, `review`).
    #[serde(rename = "loop")]
    pub loop_kind: Option<String>,
    pub findings: Vec<Finding>,
    pub cumulative: Vec<Finding>,
    pub scope: Option<String>,
    pub pr_url: Option<String>,
}

fn template_name(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Intake => "intake",
        StageKind::ValidatePlan => "validate",
        StageKind::Implement => "implement",
        StageKind::Simplify => "simplify",
        StageKind::QualityReview => "review",
        StageKind::PrReview => "pr_review",
        StageKind::QualityFix | StageKind::TestFix | StageKind::ReviewFix => "fix",
        StageKind::RunTests => "run_tests",
        StageKind::TestValidate => "test_validate",
        StageKind::Docs => "docs",
        StageKind::Publish => "publish",
        StageKind::Finalize => "finalize",
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for &(name, source) in TEMPLATES {
            env.add_template(name, source)
                .expect("embedded stage templates should be valid");
        }
        Self { env }
    }

    pub fn render(&self, kind: StageKind, ctx: &PromptContext) -> Result<String> {
        let name = template_name(kind);
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load template {name}"))?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render template {name}"))?;
        Ok(rendered.trim().to_string() + "\n")
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;

    const ALL_KINDS: [StageKind; 14] = [
        StageKind::Intake,
        StageKind::ValidatePlan,
        StageKind::Implement,
        StageKind::Simplify,
        StageKind::QualityReview,
        StageKind::QualityFix,
        StageKind::RunTests,
        StageKind::TestValidate,
        StageKind::TestFix,
        StageKind::Docs,
        StageKind::Publish,
        StageKind::PrReview,
        StageKind::ReviewFix,
        StageKind::Finalize,
    ];

    fn context() -> PromptContext {
        let task = Task {
            id: 2,
            description: "**(S)** add --dry-run flag".to_string(),
            agent: None,
            status: TaskStatus::InProgress,
            review_attempts: 1,
        };
        PromptContext {
            issue: IssueContext {
                id: "42".to_string(),
                title: "Dry run mode".to_string(),
                body: "Allow previewing changes.".to_string(),
            },
            base_branch: "main".to_string(),
            feature_branch: "conveyor/issue-42".to_string(),
            tasks: vec![task.clone()],
            task: Some(task),
            attempt: 1,
            iteration: 2,
            loop_kind: Some("review".to_string()),
            findings: vec![Finding::new("flag is undocumented")],
            cumulative: vec![Finding::new("missing test")],
            scope: Some("code".to_string()),
            pr_url: None,
        }
    }

    #[test]
    fn every_stage_kind_renders() {
        let engine = PromptEngine::new();
        for kind in ALL_KINDS {
            let text = engine.render(kind, &context()).expect("render");
            assert!(text.contains("42"), "{kind} should mention the issue");
        }
    }

    #[test]
    fn fix_instruction_lists_current_and_cumulative_findings() {
        let text = PromptEngine::new()
            .render(StageKind::ReviewFix, &context())
            .expect("render");
        assert!(text.contains("Address review feedback"));
        assert!(text.contains("- flag is undocumented"));
        assert!(text.contains("- missing test"));
    }

    #[test]
    fn review_of_unpublished_branch_names_branch() {
        let text = PromptEngine::new()
            .render(StageKind::PrReview, &context())
            .expect("render");
        assert!(text.starts_with("Review pull request conveyor/issue-42"));
    }
}
