use std::{ffi::OsStr, path::Path, process::Stdio, time::Duration};

use anyhow::Context as _;
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    process::Command,
    time::timeout,
};
use tracing::debug;

/// Outcome of running a subprocess to completion (or giving up on it).
#[derive(Debug)]
pub enum Communicated {
    Finished {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
}

/// Build a command that runs `command_line` through the shell in `dir`, with
/// stdio piped and the child in its own process group so a timeout can kill
/// the whole tree, not just the shell.
pub fn shell(command_line: &str, dir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line).current_dir(dir);
    configure(&mut cmd);
    cmd
}

/// Build an argv-style command (no shell). Callers set `current_dir` where
/// it matters.
pub fn command<I, S>(program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    configure(&mut cmd);
    cmd
}

fn configure(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
}

/// Run the command to completion, optionally feeding `stdin_data` and
/// closing stdin, optionally bounded by `limit`.
///
/// On timeout the child's process group gets SIGKILL and the child is
/// reaped before returning; no partial output is reported.
pub async fn communicate(
    mut cmd: Command,
    stdin_data: Option<Vec<u8>>,
    limit: Option<Duration>,
) -> anyhow::Result<Communicated> {
    if stdin_data.is_some() {
        cmd.stdin(Stdio::piped());
    }
    let mut child = cmd.spawn().context("spawning subprocess")?;
    let pid = child.id();

    let stdin_pipe = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Drain both output pipes while feeding stdin; draining concurrently
    // with wait() avoids deadlocking on a full pipe buffer.
    let io_fut = async move {
        if let Some(mut pipe) = stdin_pipe {
            if let Some(data) = &stdin_data {
                // The child may exit without reading its stdin; that's its
                // business, not an error for us.
                let _ = pipe.write_all(data).await;
            }
            // Dropping the pipe closes it, delivering EOF.
        }
        let mut out = Vec::new();
        let mut err = Vec::new();
        tokio::join!(
            async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut out).await;
                }
            },
            async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut err).await;
                }
            },
        );
        (out, err)
    };

    let combined = async {
        let ((out, err), status) = tokio::join!(io_fut, child.wait());
        (out, err, status)
    };

    let (out, err, status) = match limit {
        None => combined.await,
        Some(limit) => match timeout(limit, combined).await {
            Ok(result) => result,
            Err(_) => {
                // The combined future is gone, releasing its borrow on the
                // child. Kill the whole group, then reap.
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                let _ = child.start_kill();
                let _ = child.wait().await;
                debug!(pid, "subprocess_killed_on_timeout");
                return Ok(Communicated::TimedOut);
            }
        },
    };

    let status = status.context("waiting for subprocess")?;
    Ok(Communicated::Finished {
        // None means killed by a signal; -1 matches how we report our own
        // kills.
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out).into_owned(),
        stderr: String::from_utf8_lossy(&err).into_owned(),
    })
}

/// Run an argv command with no timeout and hand back (exit_code, stdout,
/// stderr). For git plumbing where the caller inspects the exit code itself.
pub async fn output(cmd: Command) -> anyhow::Result<(i32, String, String)> {
    match communicate(cmd, None, None).await? {
        Communicated::Finished {
            exit_code,
            stdout,
            stderr,
        } => Ok((exit_code, stdout, stderr)),
        Communicated::TimedOut => unreachable!("no timeout was set"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_shell_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = shell("echo hello; echo oops >&2; exit 3", dir.path());
        match communicate(cmd, None, None).await.unwrap() {
            Communicated::Finished {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stdout, "hello\n");
                assert_eq!(stderr, "oops\n");
            }
            Communicated::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[tokio::test]
    async fn test_stdin_is_delivered_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = shell("cat", dir.path());
        let result = communicate(cmd, Some(b"over stdin".to_vec()), None)
            .await
            .unwrap();
        match result {
            Communicated::Finished { stdout, .. } => assert_eq!(stdout, "over stdin"),
            Communicated::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = shell("sleep 30", dir.path());
        let started = Instant::now();
        let result = communicate(cmd, None, Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(matches!(result, Communicated::TimedOut));
        // The kill must not wait out the sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
