//! Append-only per-stage invocation logs under `<log_dir>/stages/`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::io::executor::ExecResponse;

pub fn stage_log_path(log_dir: &Path, label: &str) -> PathBuf {
    log_dir.join("stages").join(format!("{label}.log"))
}

/// Append one invocation (`attempt` is 1 for the first call, 2 for the rate-limit retry).
pub fn append_invocation(
    log_dir: &Path,
    label: &str,
    attempt: u32,
    response: &ExecResponse,
    limit_bytes: usize,
) -> Result<PathBuf> {
    let path = stage_log_path(log_dir, label);
    let mut buf = format!(
        "=== {label} attempt {attempt} at {} exit_code={} timed_out={} ===\n",
        Utc::now().to_rfc3339(),
        response
            .exit_code
            .map_or_else(|| "none".to_string(), |code| code.to_string()),
        response.timed_out,
    );
    buf.push_str("--- stdout ---\n");
    push_limited(&mut buf, &response.stdout, limit_bytes);
    buf.push_str("\n--- stderr ---\n");
    push_limited(&mut buf, &response.stderr, limit_bytes);
    buf.push('\n');
    append(&path, &buf)?;
    Ok(path)
}

/// Append a free-form note, e.g. a spawn failure that produced no output.
pub fn append_note(log_dir: &Path, label: &str, note: &str) -> Result<()> {
    let path = stage_log_path(log_dir, label);
    append(
        &path,
        &format!("=== {label} at {} ===\n{note}\n", Utc::now().to_rfc3339()),
    )
}

fn push_limited(buf: &mut String, text: &str, limit: usize) {
    if text.len() <= limit {
        buf.push_str(text);
        return;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    buf.push_str(&text[..cut]);
    buf.push_str(&format!("\n[truncated {} bytes]", text.len() - cut));
}

fn append(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create stage log dir {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open stage log {}", path.display()))?;
    file.write_all(contents.as_bytes())
        .with_context(|| format!("append stage log {}", path.display()))
}
