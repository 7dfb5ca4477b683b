//! Helpers for running backend commands with timeouts and bounded output.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Limits applied to every backend command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            output_limit_bytes: 100_000,
        }
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// One-line failure description suitable for a stage message.
    pub fn failure_summary(&self, label: &str) -> String {
        if self.timed_out {
            return format!("{label} timed out");
        }
        let stderr = self.stderr_text();
        let detail = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(str::trim)
            .unwrap_or("no stderr output");
        format!(
            "{label} exited with status {:?}: {detail}",
            self.status.code()
        )
    }
}

/// Run `program args…` in `workdir` and fail unless it exits successfully.
pub fn run_checked(
    program: &str,
    args: &[&str],
    workdir: &Path,
    limits: CommandLimits,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(workdir);
    let label = format!("{program} {}", args.join(" "));
    let output = run_command_with_timeout(cmd, limits.timeout, limits.output_limit_bytes)
        .with_context(|| format!("run {label}"))?;
    if !output.success() {
        return Err(anyhow!(output.failure_summary(&label)));
    }
    Ok(output)
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // A terminal interrupt reaches only redeploy; children finish their step.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_output_and_truncates() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf 'abcdef'; printf 'oops' >&2"]);
        let out = run_command_with_timeout(cmd, Duration::from_secs(10), 3).expect("run");
        assert!(out.success());
        assert_eq!(out.stdout, b"abc");
        assert_eq!(out.stdout_truncated, 3);
        assert_eq!(out.stderr, b"oop");
    }

    #[test]
    fn kills_command_after_timeout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let out = run_command_with_timeout(cmd, Duration::from_millis(100), 100).expect("run");
        assert!(out.timed_out);
        assert!(!out.success());
        assert_eq!(out.failure_summary("sleep"), "sleep timed out");
    }

    #[test]
    fn run_checked_reports_last_stderr_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = run_checked(
            "sh",
            &["-c", "echo first >&2; echo 'last words' >&2; exit 3"],
            temp.path(),
            CommandLimits::default(),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Some(3)"), "{msg}");
        assert!(msg.contains("last words"), "{msg}");
    }
}
