//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples stage orchestration from the agent
//! backend. [`CliExecutor`] spawns the configured command; tests use scripted
//! executors that return canned envelopes without spawning anything.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_with_timeout;

/// Exit code `timeout(1)` uses when it kills its child.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Log label, e.g. `implement-task-2`.
    pub label: String,
    pub workdir: PathBuf,
    /// Instruction text, fed on stdin.
    pub instruction: String,
    /// JSON Schema constraining `structured_output`.
    pub schema_path: PathBuf,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Raw result of an invocation, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResponse {
    pub exit_code: Option<i32>,
    /// The process was killed by the wall-clock timeout.
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResponse {
    /// Killed by our timeout, or by a wrapping `timeout(1)`.
    pub fn expired(&self) -> bool {
        self.timed_out || self.exit_code == Some(TIMEOUT_EXIT_CODE)
    }
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run one invocation. `Err` means the executor could not be run at all;
    /// a non-zero exit is still an `Ok` response.
    fn invoke(&self, request: &ExecRequest) -> Result<ExecResponse>;
}

/// Executor that spawns a command-line agent, e.g. `claude -p --output-format json`.
#[derive(Debug, Clone)]
pub struct CliExecutor {
    command: Vec<String>,
}

impl CliExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn build_command(&self, request: &ExecRequest, schema: &str) -> Result<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .context("executor command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(leading).arg("--json-schema").arg(schema);
        if let Some(agent) = &request.agent {
            cmd.arg("--agent").arg(agent);
        }
        if let Some(model) = &request.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.workdir);
        Ok(cmd)
    }
}

impl Executor for CliExecutor {
    #[instrument(skip_all, fields(label = %request.label, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &ExecRequest) -> Result<ExecResponse> {
        info!(workdir = %request.workdir.display(), "invoking executor");
        let schema = fs::read_to_string(&request.schema_path)
            .with_context(|| format!("read schema {}", request.schema_path.display()))?;
        let cmd = self.build_command(request, &schema)?;
        let output = run_with_timeout(
            cmd,
            Some(request.instruction.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run executor for {}", request.label))?;

        let response = ExecResponse {
            exit_code: output.status.code(),
            timed_out: output.timed_out,
            stdout: output.stdout.lossy(),
            stderr: output.stderr.lossy(),
        };
        if response.expired() {
            warn!(exit_code = ?response.exit_code, "executor timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?response.exit_code, "executor exited non-zero");
        } else {
            debug!("executor completed");
        }
        Ok(response)
    }
}
