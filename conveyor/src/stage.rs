//! Stage Runner: one executor invocation with timeout, rate-limit retry and
//! result extraction.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::envelope::Envelope;
use crate::core::rate_limit::{is_rate_limited, wait_time};
use crate::core::types::{Finding, ModelTier, StageKind, TestFailure, Verdict};
use crate::io::config::ConveyorConfig;
use crate::io::executor::{ExecRequest, ExecResponse, Executor};
use crate::io::schemas::{schema_path, violations};
use crate::io::sleeper::Sleeper;
use crate::io::stage_log::{append_invocation, append_note};

/// Ephemeral description of one invocation.
#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: StageKind,
    /// Log file stem, e.g. `implement-task-2`.
    pub label: String,
    pub instruction: String,
    pub agent: Option<String>,
    pub tier: ModelTier,
}

impl Stage {
    pub fn new(kind: StageKind, instruction: String) -> Self {
        Self {
            kind,
            label: kind.as_str().to_string(),
            instruction,
            agent: None,
            tier: kind.default_tier(),
        }
    }

    /// Append `-suffix` to the log label.
    pub fn labelled(mut self, suffix: &str) -> Self {
        self.label = format!("{}-{suffix}", self.kind.as_str());
        self
    }

    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    Timeout,
    SchemaNotFound,
    NoStructuredOutput,
    Executor,
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::SchemaNotFound => "schema_not_found",
            StageErrorKind::NoStructuredOutput => "no_structured_output",
            StageErrorKind::Executor => "executor",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success { payload: Value },
    Error { kind: StageErrorKind, message: String },
}

/// A stage that could not produce a usable result. Ends the run as `stage_failed`.
#[derive(Debug, Clone, Error)]
#[error("stage {label} failed: {reason}")]
pub struct StageFailed {
    pub label: String,
    pub reason: String,
}

impl StageFailed {
    pub fn new(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

impl StageResult {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            StageResult::Error {
                kind: StageErrorKind::Timeout,
                ..
            }
        )
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            StageResult::Success { payload } => Some(payload),
            StageResult::Error { .. } => None,
        }
    }

    /// The payload of a successful stage that reported neither `failed` nor `rate_limit`.
    pub fn into_payload(self, label: &str) -> Result<Value, StageFailed> {
        match self {
            StageResult::Success { payload } => match payload.get("status").and_then(Value::as_str) {
                Some("failed") => {
                    let summary = summary_of(&payload).unwrap_or("no summary");
                    Err(StageFailed::new(
                        label,
                        format!("stage reported failure: {summary}"),
                    ))
                }
                Some("rate_limit") => Err(StageFailed::new(
                    label,
                    "stage reported rate_limit instead of a result",
                )),
                _ => Ok(payload),
            },
            StageResult::Error { kind, message } => {
                Err(StageFailed::new(label, format!("{kind}: {message}")))
            }
        }
    }
}

pub fn summary_of(payload: &Value) -> Option<&str> {
    payload.get("summary").and_then(Value::as_str)
}

pub fn verdict_of(payload: &Value) -> Option<Verdict> {
    payload
        .get("verdict")
        .and_then(Value::as_str)
        .and_then(Verdict::parse)
}

/// `findings` array, ignoring malformed entries.
pub fn findings_of(payload: &Value) -> Vec<Finding> {
    list_of(payload, "findings")
}

/// `failures` array, ignoring malformed entries.
pub fn failures_of(payload: &Value) -> Vec<TestFailure> {
    list_of(payload, "failures")
}

/// Array `key` of `payload` decoded item by item, ignoring malformed entries.
pub fn list_of<T: serde::de::DeserializeOwned>(payload: &Value, key: &str) -> Vec<T> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub struct StageRunner<'a> {
    executor: &'a dyn Executor,
    sleeper: &'a dyn Sleeper,
    config: &'a ConveyorConfig,
    workdir: PathBuf,
    schema_dir: PathBuf,
    log_dir: PathBuf,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        sleeper: &'a dyn Sleeper,
        config: &'a ConveyorConfig,
        workdir: &Path,
        schema_dir: &Path,
        log_dir: &Path,
    ) -> Self {
        Self {
            executor,
            sleeper,
            config,
            workdir: workdir.to_path_buf(),
            schema_dir: schema_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
        }
    }

    /// Run `stage`. Never returns a Rust error; every failure is a [`StageResult::Error`].
    #[instrument(skip_all, fields(stage = %stage.label))]
    pub fn run(&self, stage: &Stage) -> StageResult {
        let schema = schema_path(&self.schema_dir, stage.kind.schema());
        if !schema.exists() {
            warn!(schema = %schema.display(), "schema not found");
            return StageResult::Error {
                kind: StageErrorKind::SchemaNotFound,
                message: format!("missing schema {}", schema.display()),
            };
        }

        let agent = stage.agent.clone().or_else(|| {
            self.config
                .executor
                .agents
                .get(stage.kind.as_str())
                .cloned()
        });
        let request = ExecRequest {
            label: stage.label.clone(),
            workdir: self.workdir.clone(),
            instruction: stage.instruction.clone(),
            schema_path: schema.clone(),
            agent,
            model: Some(self.config.executor.model_for(stage.tier).to_string()),
            timeout: self.config.timeouts.for_class(stage.kind.timeout_class()),
            output_limit_bytes: self.config.executor.output_limit_bytes,
        };
        info!(timeout_secs = request.timeout.as_secs(), "running stage");

        let mut response = match self.invoke(&request, 1) {
            Ok(response) => response,
            Err(result) => return result,
        };
        if response.expired() {
            return timeout_result(&request);
        }

        let envelope = Envelope::parse(&response.stdout);
        if let Some(envelope) = &envelope
            && is_rate_limited(envelope)
        {
            let wait = wait_time(&envelope.search_text(), &self.config.rate_limit.policy());
            warn!(wait_secs = wait.as_secs(), "rate limited, retrying once");
            self.sleeper.sleep(wait);
            response = match self.invoke(&request, 2) {
                Ok(response) => response,
                Err(result) => return result,
            };
            if response.expired() {
                return timeout_result(&request);
            }
            let retried = Envelope::parse(&response.stdout);
            if retried.as_ref().is_some_and(is_rate_limited) {
                warn!("still rate limited after retry");
                return StageResult::Error {
                    kind: StageErrorKind::Executor,
                    message: "still rate limited after retry".to_string(),
                };
            }
            return extract(retried, &response, &schema);
        }
        extract(envelope, &response, &schema)
    }

    fn invoke(&self, request: &ExecRequest, attempt: u32) -> Result<ExecResponse, StageResult> {
        match self.executor.invoke(request) {
            Ok(response) => {
                if let Err(err) = append_invocation(
                    &self.log_dir,
                    &request.label,
                    attempt,
                    &response,
                    request.output_limit_bytes,
                ) {
                    warn!(err = %format!("{err:#}"), "failed to write stage log");
                }
                Ok(response)
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "executor could not be run");
                if let Err(log_err) = append_note(
                    &self.log_dir,
                    &request.label,
                    &format!("attempt {attempt}: executor error: {message}"),
                ) {
                    warn!(err = %format!("{log_err:#}"), "failed to write stage log");
                }
                Err(StageResult::Error {
                    kind: StageErrorKind::Executor,
                    message,
                })
            }
        }
    }
}

fn timeout_result(request: &ExecRequest) -> StageResult {
    warn!(timeout_secs = request.timeout.as_secs(), "stage timed out");
    StageResult::Error {
        kind: StageErrorKind::Timeout,
        message: format!("timed out after {}s", request.timeout.as_secs()),
    }
}

fn extract(envelope: Option<Envelope>, response: &ExecResponse, schema: &Path) -> StageResult {
    let Some(envelope) = envelope else {
        let stderr = response.stderr.trim();
        if response.exit_code != Some(0) {
            return StageResult::Error {
                kind: StageErrorKind::Executor,
                message: format!(
                    "executor exited with {:?}: {}",
                    response.exit_code,
                    if stderr.is_empty() { "no output" } else { stderr }
                ),
            };
        }
        return StageResult::Error {
            kind: StageErrorKind::NoStructuredOutput,
            message: "executor printed no JSON envelope".to_string(),
        };
    };

    if let Some(payload @ Value::Object(_)) = envelope.structured_output {
        match violations(schema, &payload) {
            Ok(found) if !found.is_empty() => {
                warn!(violations = %found.join("; "), "structured output does not match schema");
            }
            Ok(_) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "could not validate structured output"),
        }
        debug!("extracted structured output");
        return StageResult::Success { payload };
    }

    let text = envelope.result.unwrap_or_default();
    if !envelope.is_error && !text.trim().is_empty() {
        debug!("synthesizing success from free-text result");
        return StageResult::Success {
            payload: json!({"status": "success", "summary": text}),
        };
    }
    if envelope.is_error {
        return StageResult::Error {
            kind: StageErrorKind::Executor,
            message: if text.trim().is_empty() {
                envelope
                    .subtype
                    .unwrap_or_else(|| "executor reported an error".to_string())
            } else {
                text
            },
        };
    }
    StageResult::Error {
        kind: StageErrorKind::NoStructuredOutput,
        message: "envelope has neither structured_output nor result".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SchemaName;
    use crate::io::schemas::ensure_schemas;
    use crate::test_support::{RecordingSleeper, ScriptedExecutor, ScriptedReply};
    use std::time::Duration;

    struct Fixture {
        _temp: tempfile::TempDir,
        root: PathBuf,
        config: ConveyorConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let root = temp.path().to_path_buf();
            ensure_schemas(&root.join("schemas"), false).expect("schemas");
            Self {
                _temp: temp,
                root,
                config: ConveyorConfig::default(),
            }
        }

        fn runner<'a>(
            &'a self,
            executor: &'a ScriptedExecutor,
            sleeper: &'a RecordingSleeper,
        ) -> StageRunner<'a> {
            StageRunner::new(
                executor,
                sleeper,
                &self.config,
                &self.root,
                &self.root.join("schemas"),
                &self.root.join("logs"),
            )
        }
    }

    fn docs_stage() -> Stage {
        Stage::new(StageKind::Docs, "update docs".to_string())
    }

    #[test]
    fn structured_output_is_preferred() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![ScriptedReply::structured(
            json!({"status": "success", "summary": "docs updated"}),
        )]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert_eq!(
            result.payload().and_then(summary_of),
            Some("docs updated")
        );
        let requests = executor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model.as_deref(), Some("haiku"));
        assert_eq!(requests[0].timeout, Duration::from_secs(15 * 60));
        assert!(fx.root.join("logs/stages/docs.log").exists());
    }

    #[test]
    fn free_text_result_becomes_success() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![ScriptedReply::text("All done.")]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert_eq!(
            result,
            StageResult::Success {
                payload: json!({"status": "success", "summary": "All done."})
            }
        );
    }

    #[test]
    fn missing_schema_short_circuits() {
        let fx = Fixture::new();
        std::fs::remove_file(schema_path(&fx.root.join("schemas"), SchemaName::Stage))
            .expect("remove schema");
        let executor = ScriptedExecutor::new(Vec::new());
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert!(matches!(
            result,
            StageResult::Error {
                kind: StageErrorKind::SchemaNotFound,
                ..
            }
        ));
        assert!(executor.requests().is_empty());
    }

    #[test]
    fn timeout_ignores_output() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![ScriptedReply::Timeout]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert!(result.is_timeout());
    }

    #[test]
    fn rate_limit_retries_exactly_once() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![
            ScriptedReply::rate_limited("usage limit reached, try again in 2 minutes"),
            ScriptedReply::rate_limited("usage limit reached"),
        ]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert_eq!(executor.requests().len(), 2);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(120 + 30)]);
        assert!(matches!(
            result,
            StageResult::Error {
                kind: StageErrorKind::Executor,
                ..
            }
        ));
        let log = std::fs::read_to_string(fx.root.join("logs/stages/docs.log")).expect("log");
        assert!(log.contains("attempt 1"));
        assert!(log.contains("attempt 2"));
    }

    #[test]
    fn rate_limit_retry_success_is_used() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![
            ScriptedReply::rate_limited("429 Too Many Requests"),
            ScriptedReply::structured(json!({"status": "success", "summary": "ok"})),
        ]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert_eq!(result.payload().and_then(summary_of), Some("ok"));
    }

    #[test]
    fn structured_rate_limit_on_retry_is_an_error() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![
            ScriptedReply::structured(json!({"status": "rate_limit"})),
            ScriptedReply::structured(json!({"status": "rate_limit"})),
        ]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert_eq!(executor.requests().len(), 2);
        assert_eq!(sleeper.sleeps().len(), 1);
        let StageResult::Error { kind, message } = result else {
            panic!("rate-limited retry must not succeed");
        };
        assert_eq!(kind, StageErrorKind::Executor);
        assert!(message.contains("still rate limited"));
    }

    #[test]
    fn rate_limit_status_is_not_a_payload() {
        let result = StageResult::Success {
            payload: json!({"status": "rate_limit"}),
        };
        let err = result.into_payload("docs").expect_err("rate_limit payload");
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn executor_error_and_spawn_failure_are_executor_errors() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![
            ScriptedReply::error("model refused"),
            ScriptedReply::SpawnFailure,
        ]);
        let sleeper = RecordingSleeper::default();
        let runner = fx.runner(&executor, &sleeper);
        for _ in 0..2 {
            assert!(matches!(
                runner.run(&docs_stage()),
                StageResult::Error {
                    kind: StageErrorKind::Executor,
                    ..
                }
            ));
        }
        assert!(sleeper.sleeps().is_empty());
    }

    #[test]
    fn garbage_output_is_no_structured_output() {
        let fx = Fixture::new();
        let executor = ScriptedExecutor::new(vec![ScriptedReply::Raw {
            stdout: "not json".to_string(),
            exit_code: 0,
        }]);
        let sleeper = RecordingSleeper::default();
        let result = fx.runner(&executor, &sleeper).run(&docs_stage());
        assert!(matches!(
            result,
            StageResult::Error {
                kind: StageErrorKind::NoStructuredOutput,
                ..
            }
        ));
    }

    #[test]
    fn configured_agent_applies_unless_stage_overrides() {
        let mut fx = Fixture::new();
        fx.config
            .executor
            .agents
            .insert("docs".to_string(), "tech-writer".to_string());
        let executor = ScriptedExecutor::new(vec![
            ScriptedReply::text("ok"),
            ScriptedReply::text("ok"),
        ]);
        let sleeper = RecordingSleeper::default();
        let runner = fx.runner(&executor, &sleeper);
        runner.run(&docs_stage());
        runner.run(&docs_stage().with_agent(Some("editor".to_string())));
        let agents: Vec<Option<String>> =
            executor.requests().into_iter().map(|r| r.agent).collect();
        assert_eq!(
            agents,
            vec![Some("tech-writer".to_string()), Some("editor".to_string())]
        );
    }

    #[test]
    fn reported_failure_status_fails_the_stage() {
        let result = StageResult::Success {
            payload: json!({"status": "failed", "summary": "could not build"}),
        };
        let err = result.into_payload("docs").expect_err("failed status");
        assert!(err.to_string().contains("could not build"));
    }

    #[test]
    fn payload_helpers_skip_malformed_entries() {
        let payload = json!({
            "verdict": "changes_requested",
            "findings": [{"description": "a"}, {"severity": "high"}],
            "failures": [{"name": "t1", "file": "tests/a.rs"}, 3]
        });
        assert_eq!(verdict_of(&payload), Some(Verdict::ChangesRequested));
        assert_eq!(findings_of(&payload).len(), 1);
        assert_eq!(failures_of(&payload).len(), 1);
    }
}
