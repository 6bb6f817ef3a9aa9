//! Scripted fakes and throwaway repositories for tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};

use crate::io::executor::{ExecRequest, ExecResponse, Executor, TIMEOUT_EXIT_CODE};
use crate::io::sleeper::Sleeper;
use crate::io::tracker::{Issue, IssueTracker};

type Effect = Box<dyn Fn(&ExecRequest) -> ScriptedReply>;

/// One canned executor reply.
pub enum ScriptedReply {
    /// `{is_error:false, structured_output:<value>}`.
    Structured(Value),
    /// `{is_error:false, result:<text>}`.
    Text(String),
    /// `{is_error:true, result:<text>}`.
    Error(String),
    /// Process killed by the timeout.
    Timeout,
    /// The executor could not be spawned.
    SpawnFailure,
    /// Arbitrary stdout and exit code.
    Raw { stdout: String, exit_code: i32 },
    /// Run a side effect (e.g. commit a file) and reply with what it returns.
    Effect(Effect),
}

impl ScriptedReply {
    pub fn structured(value: Value) -> Self {
        ScriptedReply::Structured(value)
    }

    pub fn text(text: &str) -> Self {
        ScriptedReply::Text(text.to_string())
    }

    pub fn error(text: &str) -> Self {
        ScriptedReply::Error(text.to_string())
    }

    pub fn rate_limited(text: &str) -> Self {
        ScriptedReply::Error(text.to_string())
    }

    pub fn success(summary: &str) -> Self {
        ScriptedReply::Structured(json!({"status": "success", "summary": summary}))
    }

    pub fn review(verdict: &str, findings: &[&str]) -> Self {
        let findings: Vec<Value> = findings
            .iter()
            .map(|description| json!({"description": description}))
            .collect();
        ScriptedReply::Structured(json!({
            "status": "success",
            "verdict": verdict,
            "findings": findings,
        }))
    }

    pub fn effect(effect: impl Fn(&ExecRequest) -> ScriptedReply + 'static) -> Self {
        ScriptedReply::Effect(Box::new(effect))
    }

    fn into_response(self, request: &ExecRequest) -> Result<ExecResponse> {
        let envelope = match self {
            ScriptedReply::Structured(value) => {
                json!({"is_error": false, "structured_output": value})
            }
            ScriptedReply::Text(text) => json!({"is_error": false, "result": text}),
            ScriptedReply::Error(text) => json!({"is_error": true, "result": text}),
            ScriptedReply::Timeout => {
                return Ok(ExecResponse {
                    exit_code: Some(TIMEOUT_EXIT_CODE),
                    timed_out: true,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            ScriptedReply::SpawnFailure => {
                return Err(anyhow!("spawn executor: No such file or directory"));
            }
            ScriptedReply::Raw { stdout, exit_code } => {
                return Ok(ExecResponse {
                    exit_code: Some(exit_code),
                    timed_out: false,
                    stdout,
                    stderr: String::new(),
                });
            }
            ScriptedReply::Effect(effect) => return effect(request).into_response(request),
        };
        Ok(ExecResponse {
            exit_code: Some(0),
            timed_out: false,
            stdout: envelope.to_string(),
            stderr: String::new(),
        })
    }
}

/// Executor that replays [`ScriptedReply`]s in order and records every request.
pub struct ScriptedExecutor {
    replies: RefCell<VecDeque<ScriptedReply>>,
    requests: RefCell<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.requests
            .borrow()
            .iter()
            .map(|request| request.label.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Executor for ScriptedExecutor {
    fn invoke(&self, request: &ExecRequest) -> Result<ExecResponse> {
        self.requests.borrow_mut().push(request.clone());
        let reply = self
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply left for {}", request.label))?;
        reply.into_response(request)
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}

/// Tracker with a fixed issue that records posted comments.
#[derive(Debug)]
pub struct StaticTracker {
    issue: Issue,
    comments: RefCell<Vec<String>>,
}

impl StaticTracker {
    pub fn new(title: &str, body: &str) -> Self {
        Self {
            issue: Issue {
                title: title.to_string(),
                body: body.to_string(),
            },
            comments: RefCell::new(Vec::new()),
        }
    }

    pub fn comments(&self) -> Vec<String> {
        self.comments.borrow().clone()
    }
}

impl IssueTracker for StaticTracker {
    fn fetch_issue(&self, _issue: &str) -> Result<Issue> {
        Ok(self.issue.clone())
    }

    fn post_comment(&self, _issue: &str, body: &str) -> Result<()> {
        self.comments.borrow_mut().push(body.to_string());
        Ok(())
    }
}

/// A git repository on `main` with one commit and a bare `origin` remote.
pub struct TestRepo {
    _temp: tempfile::TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().join("work");
        let origin = temp.path().join("origin.git");
        fs::create_dir_all(&root).context("create work dir")?;
        git(temp.path(), &["init", "-q", "--bare", "origin.git"])?;
        git(&root, &["init", "-q", "-b", "main"])?;
        git(&root, &["config", "user.email", "dev@example.com"])?;
        git(&root, &["config", "user.name", "Dev"])?;
        git(
            &root,
            &["remote", "add", "origin", &origin.to_string_lossy()],
        )?;
        fs::write(root.join(".gitignore"), ".conveyor/\n").context("write .gitignore")?;
        fs::write(root.join("README.md"), "# demo\n").context("write README")?;
        git(&root, &["add", "-A"])?;
        git(&root, &["commit", "-q", "-m", "init"])?;
        Ok(Self { _temp: temp, root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `path` and commit it on the current branch.
    pub fn commit_file(&self, path: &str, contents: &str) -> Result<()> {
        commit_file_in(&self.root, path, contents)
    }

    pub fn current_branch(&self) -> Result<String> {
        let out = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.root)
            .output()
            .context("spawn git")?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Write and commit a file in the repository at `root`.
pub fn commit_file_in(root: &Path, path: &str, contents: &str) -> Result<()> {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).context("create parent")?;
    }
    fs::write(&full, contents).with_context(|| format!("write {path}"))?;
    git(root, &["add", "-A"])?;
    git(root, &["commit", "-q", "-m", &format!("update {path}")])
}

fn git(dir: &Path, args: &[&str]) -> Result<()> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}
