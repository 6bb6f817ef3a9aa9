//! Orchestrator configuration stored at `.conveyor/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::rate_limit::BackoffPolicy;
use crate::core::types::{ModelTier, TimeoutClass};

/// Default location of the config file, relative to the repository root.
pub const DEFAULT_CONFIG_PATH: &str = ".conveyor/config.toml";

/// Orchestrator configuration (TOML).
///
/// Human-edited. Every section is optional and falls back to the defaults
/// below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConveyorConfig {
    pub executor: ExecutorConfig,
    pub timeouts: TimeoutConfig,
    pub rate_limit: RateLimitConfig,
    pub loops: LoopConfig,
    pub git: GitConfig,
    pub tracker: TrackerConfig,
    pub batch: BatchConfig,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program and leading arguments, e.g. `["claude", "-p", "--output-format", "json"]`.
    pub command: Vec<String>,
    pub fast_model: String,
    pub standard_model: String,
    pub deep_model: String,
    /// Keep at most this many bytes of executor stdout/stderr.
    pub output_limit_bytes: usize,
    /// Stage kind (e.g. `quality_review`) to agent name overrides.
    pub agents: BTreeMap<String, String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: ["claude", "-p", "--output-format", "json"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            fast_model: "haiku".to_string(),
            standard_model: "sonnet".to_string(),
            deep_model: "opus".to_string(),
            output_limit_bytes: 1_000_000,
            agents: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Standard => &self.standard_model,
            ModelTier::Deep => &self.deep_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Implementation, simplify and fix stages.
    pub long_secs: u64,
    /// Review and validation stages.
    pub review_secs: u64,
    /// Intake, tests, docs, publish and finalize.
    pub short_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            long_secs: 60 * 60,
            review_secs: 30 * 60,
            short_secs: 15 * 60,
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        Duration::from_secs(match class {
            TimeoutClass::Long => self.long_secs,
            TimeoutClass::Review => self.review_secs,
            TimeoutClass::Short => self.short_secs,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_wait_secs: u64,
    pub buffer_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_wait_secs: 300,
            buffer_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            default_wait: Duration::from_secs(self.default_wait_secs),
            buffer: Duration::from_secs(self.buffer_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub test_max_iterations: u32,
    /// Fraction of repeated findings that ends a review-style loop.
    pub repeat_ratio_threshold: f64,
    /// Occurrences of one failure signature that abort the run.
    pub signature_repeat_limit: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            test_max_iterations: 5,
            repeat_ratio_threshold: 0.5,
            signature_repeat_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Feature branches are named `<branch_prefix>/issue-<id>`.
    pub branch_prefix: String,
    pub remote: String,
    /// Refuse to dispatch a fix stage when HEAD is not the feature branch.
    /// When false the mismatch is only logged.
    pub enforce_branch_before_fix: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "conveyor".to_string(),
            remote: "origin".to_string(),
            enforce_branch_before_fix: true,
        }
    }
}

impl GitConfig {
    pub fn feature_branch(&self, issue: &str) -> String {
        format!("{}/issue-{}", self.branch_prefix, issue)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Suppress progress comments.
    pub quiet: bool,
    pub command: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            quiet: false,
            command: "gh".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    pub max_consecutive_failures: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

/// Locations relative to the repository root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathConfig {
    pub state_file: PathBuf,
    pub log_root: PathBuf,
    pub schema_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from(".conveyor/state.json"),
            log_root: PathBuf::from(".conveyor/runs"),
            schema_dir: PathBuf::from(".conveyor/schemas"),
        }
    }
}

impl PathConfig {
    /// Resolve relative paths against `root`.
    pub fn resolve(&self, root: &Path) -> PathConfig {
        PathConfig {
            state_file: root.join(&self.state_file),
            log_root: root.join(&self.log_root),
            schema_dir: root.join(&self.schema_dir),
        }
    }
}

impl ConveyorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        for (name, secs) in [
            ("timeouts.long_secs", self.timeouts.long_secs),
            ("timeouts.review_secs", self.timeouts.review_secs),
            ("timeouts.short_secs", self.timeouts.short_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.loops.test_max_iterations == 0 {
            return Err(anyhow!("loops.test_max_iterations must be > 0"));
        }
        let threshold = self.loops.repeat_ratio_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "loops.repeat_ratio_threshold must be in (0, 1], got {threshold}"
            ));
        }
        if self.loops.signature_repeat_limit < 2 {
            return Err(anyhow!("loops.signature_repeat_limit must be >= 2"));
        }
        if self.git.branch_prefix.trim().is_empty() {
            return Err(anyhow!("git.branch_prefix must not be empty"));
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must not be empty"));
        }
        if self.tracker.command.trim().is_empty() {
            return Err(anyhow!("tracker.command must not be empty"));
        }
        if self.batch.max_consecutive_failures == 0 {
            return Err(anyhow!("batch.max_consecutive_failures must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ConveyorConfig::default()`.
pub fn load_config(path: &Path) -> Result<ConveyorConfig> {
    if !path.exists() {
        let cfg = ConveyorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ConveyorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ConveyorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
