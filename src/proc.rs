// src/proc.rs
//
// =============================================================================
// DROIDFLOW: SUBPROCESS UTILITIES
// =============================================================================
//
// Standardized command execution for everything that shells out (adb,
// vendor manager CLIs). One place owns the rules:
// 1. Every invocation carries a timeout; expiry kills the child.
// 2. Output is captured and decoded as lossy UTF-8.
// 3. On Windows, children must not flash a console window.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured outcome of a finished (or killed) child process.
#[derive(Debug, Clone)]
pub struct ProcOutput {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcOutput {
    fn timeout() -> Self {
        Self {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: "timeout".into(),
        }
    }
}

/// Builds a command with piped output and the platform-appropriate
/// spawn flags applied.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    hide_window(&mut cmd);
    cmd
}

/// Suppress the console window for GUI-host deployments. The flags are
/// CREATE_NO_WINDOW | DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP so the
/// child neither inherits nor creates a console and ctrl-c stays ours.
#[cfg(windows)]
fn hide_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(windows))]
fn hide_window(_cmd: &mut Command) {}

/// Runs `program args…` to completion within `timeout`.
///
/// A timeout is reported as `ok = false` with stderr `"timeout"`, not as
/// an `Err` — callers treat it like any other failed command. `Err` is
/// reserved for spawn failures (binary missing, permissions).
pub async fn run_with_timeout<S, I>(
    program: S,
    args: I,
    timeout: Duration,
) -> Result<ProcOutput>
where
    S: AsRef<OsStr>,
    I: IntoIterator,
    I::Item: AsRef<OsStr>,
{
    let mut cmd = command(program.as_ref());
    cmd.args(args);

    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {:?}", program.as_ref()))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.context("child wait failed")?;
            Ok(ProcOutput {
                ok: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Err(_) => {
            // kill_on_drop reaps the child once the future is dropped.
            log::warn!("command timed out after {:?}: {:?}", timeout, program.as_ref());
            Ok(ProcOutput::timeout())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_with_timeout("echo", ["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(out.ok);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn timeout_reports_failure_not_error() {
        let out = run_with_timeout("sleep", ["5"], Duration::from_millis(100))
            .await
            .unwrap();
        assert!(!out.ok);
        assert_eq!(out.stderr, "timeout");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let res = run_with_timeout("droidflow-no-such-binary", ["x"], Duration::from_secs(1)).await;
        assert!(res.is_err());
    }
}
