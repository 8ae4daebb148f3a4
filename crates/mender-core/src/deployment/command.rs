//! External test and validation commands.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tracing::debug;

use crate::domain::TestResult;

/// Deployment phases that run commands.
pub const PHASE_SANDBOX: &str = "sandbox";
pub const PHASE_VERIFY: &str = "verify";
pub const PHASE_ROLLBACK_VALIDATE: &str = "rollback_validate";

fn shell(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Run `command` through the OS shell in `cwd`, bounded by `timeout`.
///
/// Never fails: a spawn error or an expired deadline is reported as a
/// failed [`TestResult`]. The child is killed when the deadline passes.
pub async fn run_command(phase: &str, command: &str, cwd: &Path, timeout: Duration) -> TestResult {
    let start = Instant::now();
    let ran_at = Utc::now();
    let mut result = TestResult {
        phase: phase.to_string(),
        command: command.to_string(),
        passed: false,
        exit_code: None,
        output: String::new(),
        duration_ms: 0,
        timed_out: false,
        ran_at,
    };

    let child = shell(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            result.output = format!("failed to spawn: {e}");
            result.duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            result.output = combined;
            result.exit_code = output.status.code();
            result.passed = output.status.success();
        }
        Ok(Err(e)) => result.output = format!("failed to wait: {e}"),
        Err(_) => {
            result.timed_out = true;
            result.output = format!("timed out after {}ms", timeout.as_millis());
        }
    }
    result.duration_ms = start.elapsed().as_millis() as u64;
    debug!(
        phase,
        command,
        passed = result.passed,
        exit_code = ?result.exit_code,
        duration_ms = result.duration_ms,
        "command finished"
    );
    result
}

/// One-line summary for failure reasons.
pub fn summarize(result: &TestResult) -> String {
    if result.timed_out {
        return format!("`{}` timed out", result.command);
    }
    let last = result.output.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    match result.exit_code {
        Some(code) => format!("`{}` exited with {code}: {last}", result.command),
        None => format!("`{}` failed: {last}", result.command),
    }
}
