use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stages of a workflow run, in execution order.
///
/// The derived `Ord` is the pipeline order; resume logic relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Intake,
    Validate,
    Implement,
    TestLoop,
    Docs,
    Publish,
    ReviewLoop,
    Finalize,
}

impl StageName {
    pub const ALL: [StageName; 8] = [
        StageName::Intake,
        StageName::Validate,
        StageName::Implement,
        StageName::TestLoop,
        StageName::Docs,
        StageName::Publish,
        StageName::ReviewLoop,
        StageName::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageName::Intake => "intake",
            StageName::Validate => "validate",
            StageName::Implement => "implement",
            StageName::TestLoop => "test_loop",
            StageName::Docs => "docs",
            StageName::Publish => "publish",
            StageName::ReviewLoop => "review_loop",
            StageName::Finalize => "finalize",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    /// Implementation succeeded; the quality loop has not approved it yet.
    Implemented,
    Completed,
    Failed,
}

/// One unit of implementation work extracted from the issue at intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable 1-based identifier.
    pub id: u32,
    /// Task text; may embed a size marker such as `**(S)**`.
    pub description: String,
    /// Agent the implementation stage should run as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    /// Implementation attempts consumed so far.
    #[serde(default)]
    pub review_attempts: u32,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Coarse task size parsed from a size marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeLabel {
    Small,
    Medium,
    Large,
}

impl SizeLabel {
    /// Parse `S`/`M`/`L` (or the spelled-out word), case-insensitively.
    pub fn parse(raw: &str) -> Option<SizeLabel> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "S" | "SMALL" => Some(SizeLabel::Small),
            "M" | "MEDIUM" => Some(SizeLabel::Medium),
            "L" | "LARGE" => Some(SizeLabel::Large),
            _ => None,
        }
    }
}

/// A single reviewer or validator finding. Identity is the description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Finding {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            severity: None,
            file: None,
        }
    }
}

/// A failing test reported by the run-tests stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TestFailure {
    pub fn to_finding(&self) -> Finding {
        let mut description = match &self.file {
            Some(file) => format!("test {} failed ({file})", self.name),
            None => format!("test {} failed", self.name),
        };
        if let Some(message) = self.message.as_deref().filter(|m| !m.trim().is_empty()) {
            description.push_str(": ");
            description.push_str(message.trim());
        }
        Finding {
            description,
            severity: Some("error".to_string()),
            file: self.file.clone(),
        }
    }
}

/// Terminal classification of a loop stage's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    ChangesRequested,
    Passed,
    Failed,
}

impl Verdict {
    pub fn parse(raw: &str) -> Option<Verdict> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(Verdict::Approved),
            "changes_requested" => Some(Verdict::ChangesRequested),
            "passed" => Some(Verdict::Passed),
            "failed" => Some(Verdict::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::ChangesRequested => "changes_requested",
            Verdict::Passed => "passed",
            Verdict::Failed => "failed",
        }
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Verdict::Approved | Verdict::Passed)
    }
}

/// Coarse category of the files changed on the feature branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    /// Application code, including unrecognized extensions.
    Code,
    /// Shell and test-script files.
    Scripts,
    /// Docs, manifests, lockfiles and ignore files only (or nothing at all).
    Config,
    /// Both code and scripts.
    Mixed,
}

impl ChangeScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeScope::Code => "code",
            ChangeScope::Scripts => "scripts",
            ChangeScope::Config => "config",
            ChangeScope::Mixed => "mixed",
        }
    }
}

/// The three refinement loop instantiations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    Quality,
    Test,
    Review,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopKind::Quality => "quality",
            LoopKind::Test => "test",
            LoopKind::Review => "review",
        })
    }
}

/// Model complexity hint forwarded to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Fast,
    Standard,
    Deep,
}

/// Timeout buckets for stage invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    /// Implementation, simplification and fix stages.
    Long,
    /// Review and validation stages.
    Review,
    /// Intake, test, docs, publish and finalize stages.
    Short,
}

/// Output schema documents shipped with the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaName {
    Intake,
    Stage,
    Review,
    TestRun,
    TestValidation,
    Publish,
}

impl SchemaName {
    pub const ALL: [SchemaName; 6] = [
        SchemaName::Intake,
        SchemaName::Stage,
        SchemaName::Review,
        SchemaName::TestRun,
        SchemaName::TestValidation,
        SchemaName::Publish,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            SchemaName::Intake => "intake.schema.json",
            SchemaName::Stage => "stage.schema.json",
            SchemaName::Review => "review.schema.json",
            SchemaName::TestRun => "test_run.schema.json",
            SchemaName::TestValidation => "test_validation.schema.json",
            SchemaName::Publish => "publish.schema.json",
        }
    }
}

/// Every kind of executor invocation the orchestrator issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Intake,
    ValidatePlan,
    Implement,
    Simplify,
    QualityReview,
    QualityFix,
    RunTests,
    TestValidate,
    TestFix,
    Docs,
    Publish,
    PrReview,
    ReviewFix,
    Finalize,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Intake => "intake",
            StageKind::ValidatePlan => "validate_plan",
            StageKind::Implement => "implement",
            StageKind::Simplify => "simplify",
            StageKind::QualityReview => "quality_review",
            StageKind::QualityFix => "quality_fix",
            StageKind::RunTests => "run_tests",
            StageKind::TestValidate => "test_validate",
            StageKind::TestFix => "test_fix",
            StageKind::Docs => "docs",
            StageKind::Publish => "publish",
            StageKind::PrReview => "pr_review",
            StageKind::ReviewFix => "review_fix",
            StageKind::Finalize => "finalize",
        }
    }

    pub fn timeout_class(self) -> TimeoutClass {
        match self {
            StageKind::Implement
            | StageKind::Simplify
            | StageKind::QualityFix
            | StageKind::TestFix
            | StageKind::ReviewFix => TimeoutClass::Long,
            StageKind::ValidatePlan
            | StageKind::QualityReview
            | StageKind::TestValidate
            | StageKind::PrReview => TimeoutClass::Review,
            StageKind::Intake
            | StageKind::RunTests
            | StageKind::Docs
            | StageKind::Publish
            | StageKind::Finalize => TimeoutClass::Short,
        }
    }

    pub fn schema(self) -> SchemaName {
        match self {
            StageKind::Intake => SchemaName::Intake,
            StageKind::QualityReview | StageKind::PrReview => SchemaName::Review,
            StageKind::RunTests => SchemaName::TestRun,
            StageKind::TestValidate => SchemaName::TestValidation,
            StageKind::Publish => SchemaName::Publish,
            StageKind::ValidatePlan
            | StageKind::Implement
            | StageKind::Simplify
            | StageKind::QualityFix
            | StageKind::TestFix
            | StageKind::Docs
            | StageKind::ReviewFix
            | StageKind::Finalize => SchemaName::Stage,
        }
    }

    pub fn default_tier(self) -> ModelTier {
        match self {
            StageKind::Intake
            | StageKind::RunTests
            | StageKind::Docs
            | StageKind::Publish
            | StageKind::Finalize => ModelTier::Fast,
            StageKind::Simplify | StageKind::ValidatePlan | StageKind::TestValidate => {
                ModelTier::Standard
            }
            StageKind::Implement
            | StageKind::QualityReview
            | StageKind::QualityFix
            | StageKind::TestFix
            | StageKind::PrReview
            | StageKind::ReviewFix => ModelTier::Deep,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_matches_pipeline() {
        let mut sorted = StageName::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, StageName::ALL.to_vec());
        assert!(StageName::Intake < StageName::Finalize);
        assert!(StageName::TestLoop < StageName::ReviewLoop);
    }

    #[test]
    fn stage_names_serialize_snake_case() {
        let json = serde_json::to_string(&StageName::ReviewLoop).expect("serialize");
        assert_eq!(json, "\"review_loop\"");
    }

    #[test]
    fn fix_and_implementation_stages_get_long_timeouts() {
        for kind in [
            StageKind::Implement,
            StageKind::QualityFix,
            StageKind::TestFix,
            StageKind::ReviewFix,
        ] {
            assert_eq!(kind.timeout_class(), TimeoutClass::Long, "{kind}");
        }
        assert_eq!(StageKind::PrReview.timeout_class(), TimeoutClass::Review);
        assert_eq!(StageKind::RunTests.timeout_class(), TimeoutClass::Short);
        assert_eq!(StageKind::Publish.timeout_class(), TimeoutClass::Short);
    }

    #[test]
    fn size_labels_parse_short_and_long_forms() {
        assert_eq!(SizeLabel::parse("s"), Some(SizeLabel::Small));
        assert_eq!(SizeLabel::parse(" Medium "), Some(SizeLabel::Medium));
        assert_eq!(SizeLabel::parse("L"), Some(SizeLabel::Large));
        assert_eq!(SizeLabel::parse("XL"), None);
    }

    #[test]
    fn test_failure_finding_includes_file_and_message() {
        let failure = TestFailure {
            name: "parses_empty".to_string(),
            file: Some("tests/parse.rs".to_string()),
            message: Some("assertion failed".to_string()),
        };
        let finding = failure.to_finding();
        assert_eq!(
            finding.description,
            "test parses_empty failed (tests/parse.rs): assertion failed"
        );
        assert_eq!(finding.file.as_deref(), Some("tests/parse.rs"));
    }
}
