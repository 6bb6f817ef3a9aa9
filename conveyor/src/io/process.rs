//! Agent subprocesses: a wall-clock deadline and capped output capture.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Bytes kept from one output stream plus how many were dropped past the cap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    fn drain<R: Read>(mut reader: R, cap: usize) -> Result<Capture> {
        let mut capture = Capture::default();
        let mut chunk = [0u8; 8192];
        loop {
            let read = reader.read(&mut chunk).context("read child output")?;
            if read == 0 {
                return Ok(capture);
            }
            let room = cap.saturating_sub(capture.bytes.len()).min(read);
            capture.bytes.extend_from_slice(&chunk[..room]);
            capture.dropped += read - room;
        }
    }
}

#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    /// Killed at the deadline.
    pub timed_out: bool,
}

/// Run `cmd` to completion or until `deadline`, writing `input` to its stdin.
///
/// Both pipes are drained concurrently, so the child never stalls on a full
/// pipe; each stream keeps at most `cap` bytes.
#[instrument(skip_all, fields(program = %cmd.get_program().to_string_lossy(), deadline_secs = deadline.as_secs()))]
pub fn run_with_timeout(
    mut cmd: Command,
    input: Option<&[u8]>,
    deadline: Duration,
    cap: usize,
) -> Result<Finished> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))?;
    let out_pipe = child.stdout.take().ok_or_else(|| anyhow!("child stdout not piped"))?;
    let err_pipe = child.stderr.take().ok_or_else(|| anyhow!("child stderr not piped"))?;

    let (status, timed_out, stdout, stderr) = thread::scope(|scope| -> Result<_> {
        let out_reader = scope.spawn(move || Capture::drain(out_pipe, cap));
        let err_reader = scope.spawn(move || Capture::drain(err_pipe, cap));

        if let Some(input) = input {
            feed_stdin(&mut child, input)?;
        }
        let (status, timed_out) = wait_or_kill(&mut child, deadline)?;

        let stdout = out_reader
            .join()
            .map_err(|_| anyhow!("stdout reader panicked"))??;
        let stderr = err_reader
            .join()
            .map_err(|_| anyhow!("stderr reader panicked"))??;
        Ok((status, timed_out, stdout, stderr))
    })?;

    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "child output exceeded cap"
        );
    }
    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(Finished {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn feed_stdin(child: &mut Child, input: &[u8]) -> Result<()> {
    // Dropping the handle closes the pipe so the child sees EOF.
    let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("child stdin not piped"))?;
    if let Err(err) = stdin.write_all(input) {
        warn!(%err, "child stopped reading stdin");
    }
    Ok(())
}

fn wait_or_kill(child: &mut Child, deadline: Duration) -> Result<(ExitStatus, bool)> {
    if let Some(status) = child.wait_timeout(deadline).context("wait for child")? {
        return Ok((status, false));
    }
    warn!(deadline_secs = deadline.as_secs(), "deadline reached, killing child");
    child.kill().context("kill child")?;
    let status = child.wait().context("reap killed child")?;
    Ok((status, true))
}
