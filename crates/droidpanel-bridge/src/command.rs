use std::{ffi::OsStr, process::Stdio, time::Duration};

use serde::Serialize;
use tokio::process::Command;

/// Outcome of one external command invocation. Every failure mode is
/// captured into the record; nothing propagates to the caller.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: Option<i32>,
    pub error: Option<String>,
}

impl CommandResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// stdout and stderr merged, trimmed, for human-readable responses.
    pub fn combined_output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        if stdout.is_empty() {
            stderr.to_string()
        } else if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        }
    }

    /// Best available failure description.
    pub fn failure_message(&self) -> String {
        if let Some(error) = self.error.as_ref() {
            return error.clone();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.returncode {
            Some(code) => format!("command exited with status {code}"),
            None => "command failed".to_string(),
        }
    }
}

/// Runs a command to completion with a hard timeout, capturing output in
/// full. On timeout the child is killed, not leaked (`kill_on_drop`).
pub async fn run_command(
    program: impl AsRef<OsStr>,
    args: &[&str],
    timeout: Duration,
) -> CommandResult {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => return CommandResult::failed(err.to_string()),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            returncode: output.status.code(),
            error: None,
        },
        Ok(Err(err)) => CommandResult::failed(err.to_string()),
        Err(_) => CommandResult::failed("command timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_status() {
        let result = run_command("sh", &["-c", "echo hello"], Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.returncode, Some(0));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_is_captured_not_raised() {
        let result = run_command("sh", &["-c", "echo oops >&2; exit 3"], Duration::from_secs(5)).await;
        assert!(!result.success);
        assert_eq!(result.stderr, "oops");
        assert_eq!(result.returncode, Some(3));
    }

    #[tokio::test]
    async fn missing_program_becomes_error_record() {
        let result = run_command("droidpanel-no-such-binary", &[], Duration::from_secs(5)).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.returncode, None);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let result = run_command("sh", &["-c", "sleep 30"], Duration::from_millis(200)).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("command timed out"));
    }

    #[test]
    fn combined_output_merges_streams() {
        let result = CommandResult {
            success: true,
            stdout: "out".into(),
            stderr: "err".into(),
            returncode: Some(0),
            error: None,
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }
}
