//! Helpers for running child processes with timeouts and bounded output.
//!
//! Spawning and waiting are split so callers can report a launch failure
//! synchronously and then wait for the child on a background thread.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

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
    pub fn stdout_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            out.push_str(&format!("\n[stdout truncated {} bytes]\n", self.stdout_truncated));
        }
        out
    }

    pub fn stderr_lossy(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            out.push_str(&format!("\n[stderr truncated {} bytes]\n", self.stderr_truncated));
        }
        out
    }
}

/// A spawned child whose stdin has already been written and closed.
///
/// Output is drained on reader threads from the moment of spawn, so a chatty
/// child never blocks on a full pipe while nobody is waiting for it.
#[derive(Debug)]
pub struct RunningCommand {
    child: Child,
    stdout: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    stderr: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
}

/// Spawn a command, feed it `stdin`, and start draining its output.
#[instrument(skip_all, fields(output_limit_bytes))]
pub fn spawn_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    output_limit_bytes: usize,
) -> Result<RunningCommand> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout: ChildStdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr: ChildStderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        // A child that exits without reading its stdin is not a launch failure.
        if let Err(err) = child_stdin.write_all(input) {
            warn!(err = %err, "child closed stdin early");
        }
    }

    Ok(RunningCommand {
        child,
        stdout,
        stderr,
    })
}

impl RunningCommand {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the child, killing it once `timeout` elapses.
    #[instrument(skip_all, fields(pid = self.child.id(), timeout_secs = timeout.as_secs()))]
    pub fn wait_with_timeout(mut self, timeout: Duration) -> Result<CommandOutput> {
        let mut timed_out = false;
        let status = match self.child.wait_timeout(timeout).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
                self.child.kill().context("kill command")?;
                self.child.wait().context("wait command after kill")?
            }
        };

        let (stdout, stdout_truncated) = join_output(self.stdout).context("join stdout")?;
        let (stderr, stderr_truncated) = join_output(self.stderr).context("join stderr")?;

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
}

/// Run a command to completion with a timeout and capture stdout/stderr.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    spawn_command(cmd, stdin, output_limit_bytes)?.wait_with_timeout(timeout)
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdin_echo() {
        let out = run_command_with_timeout(sh("cat"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert!(out.status.success());
        assert!(!out.timed_out);
        assert_eq!(out.stdout_lossy(), "hello");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command_with_timeout(
            sh("printf 'abcdefghij'"),
            None,
            Duration::from_secs(10),
            4,
        )
        .expect("run");
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 6);
        assert!(out.stdout_lossy().contains("truncated 6 bytes"));
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command_with_timeout(sh("sleep 5"), None, Duration::from_millis(100), 1024)
            .expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
    }

    #[test]
    fn spawn_failure_is_reported_synchronously() {
        let err = spawn_command(Command::new("/definitely/not/a/binary"), None, 16).unwrap_err();
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
