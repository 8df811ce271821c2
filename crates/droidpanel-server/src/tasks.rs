use std::{
    process::Stdio,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::watch,
};
use tracing::{info, warn};

use droidpanel_bridge::device::{query_devices, start_server};
use droidpanel_bridge::ime::try_enable_keyboard;
use droidpanel_bridge::{adb_path, KEYBOARD_IME};

use crate::config::{ProviderConfig, KEYLESS_PROVIDER};

const DEVICE_POLL_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Serialize)]
pub struct TaskResult {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Debug, Default)]
struct TaskRecord {
    running: bool,
    logs: Vec<String>,
    result: Option<TaskResult>,
}

/// Snapshot returned to pollers; the full log on every poll.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub running: bool,
    pub logs: Vec<String>,
    pub result: Option<TaskResult>,
    pub total_logs: usize,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a task is already running")]
    AlreadyRunning,
    #[error("task text is empty")]
    EmptyTask,
    #[error("no API key configured for provider {0}")]
    CredentialMissing(String),
}

#[derive(Debug, Error)]
#[error("a task is still running")]
pub struct ClearConflict;

/// Owns the single task record and at most one background worker. At most
/// one task runs at a time; concurrent starts are rejected while the
/// record is `running`.
pub struct TaskSupervisor {
    record: Arc<Mutex<TaskRecord>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    settle_delay: Duration,
    poll_delay: Duration,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::with_delays(Duration::from_secs(1), Duration::from_secs(2))
    }
}

impl TaskSupervisor {
    pub fn with_delays(settle_delay: Duration, poll_delay: Duration) -> Self {
        Self {
            record: Arc::new(Mutex::new(TaskRecord::default())),
            cancel: Mutex::new(None),
            settle_delay,
            poll_delay,
        }
    }

    /// Validates and, if accepted, resets the record and spawns the worker.
    /// Returns immediately; progress is observed through `status()`.
    pub fn start(
        &self,
        task_text: &str,
        provider_name: &str,
        provider: ProviderConfig,
    ) -> Result<(), StartError> {
        {
            // The running guard comes first: a busy supervisor reports the
            // conflict even when the request is otherwise malformed.
            let mut record = self.record.lock().unwrap();
            if record.running {
                return Err(StartError::AlreadyRunning);
            }
            if task_text.trim().is_empty() {
                return Err(StartError::EmptyTask);
            }
            if provider.api_key.is_empty() && provider_name != KEYLESS_PROVIDER {
                return Err(StartError::CredentialMissing(provider_name.to_string()));
            }
            *record = TaskRecord {
                running: true,
                logs: Vec::new(),
                result: None,
            };
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.cancel.lock().unwrap() = Some(cancel_tx);

        let worker = TaskWorker {
            record: Arc::clone(&self.record),
            cancel_rx,
            settle_delay: self.settle_delay,
            poll_delay: self.poll_delay,
            task_text: task_text.to_string(),
            provider,
        };
        info!("starting agent task");
        tokio::spawn(worker.run());
        Ok(())
    }

    pub fn status(&self) -> TaskSnapshot {
        let record = self.record.lock().unwrap();
        TaskSnapshot {
            running: record.running,
            logs: record.logs.clone(),
            result: record.result.clone(),
            total_logs: record.logs.len(),
        }
    }

    /// Signals the worker to kill the agent process. Returns false when no
    /// task is running.
    pub fn stop(&self) -> bool {
        if !self.record.lock().unwrap().running {
            return false;
        }
        match self.cancel.lock().unwrap().as_ref() {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Resets a terminal record back to idle. Rejected while running.
    pub fn clear(&self) -> Result<(), ClearConflict> {
        let mut record = self.record.lock().unwrap();
        if record.running {
            return Err(ClearConflict);
        }
        *record = TaskRecord::default();
        Ok(())
    }
}

struct TaskWorker {
    record: Arc<Mutex<TaskRecord>>,
    cancel_rx: watch::Receiver<bool>,
    settle_delay: Duration,
    poll_delay: Duration,
    task_text: String,
    provider: ProviderConfig,
}

impl TaskWorker {
    fn log(&self, line: impl Into<String>) {
        self.record.lock().unwrap().logs.push(line.into());
    }

    fn finish(&self, success: bool, message: impl Into<String>) {
        let mut record = self.record.lock().unwrap();
        record.result = Some(TaskResult {
            success,
            message: message.into(),
        });
        record.running = false;
    }

    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn run(self) {
        if let Some(outcome) = self.execute().await {
            self.finish(outcome.success, outcome.message);
        } else {
            self.finish(false, "task stopped manually");
        }
        // The record can never be left running, whatever path got us here.
        debug_assert!(!self.record.lock().unwrap().running);
    }

    /// Readiness sequence then agent execution. Returns None when the task
    /// was cancelled, Some(result) otherwise.
    async fn execute(&self) -> Option<TaskResult> {
        self.log("initializing device bridge...");
        let _ = start_server().await;
        tokio::time::sleep(self.settle_delay).await;
        if self.cancelled() {
            return None;
        }

        // Device presence is best-effort: the agent gets to try either way.
        let mut device_seen = false;
        for attempt in 0..DEVICE_POLL_ATTEMPTS {
            if query_devices().await.any_online() {
                self.log("device connected");
                device_seen = true;
                break;
            }
            self.log(format!(
                "waiting for device... (attempt {}/{DEVICE_POLL_ATTEMPTS})",
                attempt + 1
            ));
            tokio::time::sleep(self.poll_delay).await;
            if self.cancelled() {
                return None;
            }
        }
        if !device_seen {
            warn!("no device detected before agent start");
            self.log("no device detected, proceeding anyway...");
        }

        self.ensure_keyboard().await;
        if self.cancelled() {
            return None;
        }

        self.log(format!("running task: {}", self.task_text));
        self.spawn_and_pump().await
    }

    async fn ensure_keyboard(&self) {
        let ime = droidpanel_bridge::device::adb_command(
            &["shell", "ime", "list", "-s"],
            Duration::from_secs(10),
        )
        .await;
        if ime.stdout.contains(KEYBOARD_IME) {
            self.log("virtual keyboard enabled");
        } else {
            self.log("virtual keyboard not enabled, trying to enable it...");
            try_enable_keyboard().await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    fn agent_command(&self) -> Command {
        let agent_dir = droidpanel_util::agent_dir();
        let mut cmd = Command::new(droidpanel_util::python_command());
        cmd.arg(agent_dir.join("main.py"))
            .arg("--base-url")
            .arg(&self.provider.base_url)
            .arg("--model")
            .arg(&self.provider.model);
        if !self.provider.api_key.is_empty() {
            cmd.arg("--apikey").arg(&self.provider.api_key);
        }
        cmd.arg(&self.task_text);
        cmd.current_dir(&agent_dir);

        // The agent must resolve our adb copy, and its output may carry
        // emoji the platform default encoding would mangle.
        let tools_dir = adb_path()
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(droidpanel_util::platform_tools_dir);
        let path = std::env::var("PATH").unwrap_or_default();
        let sep = if cfg!(windows) { ';' } else { ':' };
        cmd.env("PATH", format!("{}{sep}{path}", tools_dir.display()));
        cmd.env("PYTHONIOENCODING", "utf-8");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Spawns the agent and pumps its output into the shared log line by
    /// line, so pollers see partial progress. A cancel kills the child.
    async fn spawn_and_pump(&self) -> Option<TaskResult> {
        let mut child = match self.agent_command().spawn() {
            Ok(child) => child,
            Err(err) => {
                return Some(TaskResult {
                    success: false,
                    message: format!("failed to launch agent: {err}"),
                });
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_pump = stdout.map(|s| tokio::spawn(pump_lines(s, Arc::clone(&self.record))));
        let err_pump = stderr.map(|s| tokio::spawn(pump_lines(s, Arc::clone(&self.record))));

        let mut cancel_rx = self.cancel_rx.clone();
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel_rx.changed() => {
                if let Err(err) = child.kill().await {
                    warn!("failed to kill agent process: {err}");
                }
                let _ = child.wait().await;
                await_pumps(out_pump, err_pump).await;
                return None;
            }
        };
        await_pumps(out_pump, err_pump).await;

        Some(match status {
            Ok(status) if status.success() => TaskResult {
                success: true,
                message: "task completed".to_string(),
            },
            Ok(status) => TaskResult {
                success: false,
                message: format!(
                    "task failed (exit code: {})",
                    status
                        .code()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "killed".to_string())
                ),
            },
            Err(err) => TaskResult {
                success: false,
                message: format!("task failed: {err}"),
            },
        })
    }
}

async fn pump_lines<R>(reader: R, record: Arc<Mutex<TaskRecord>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim_end().to_string();
        if !trimmed.is_empty() {
            record.lock().unwrap().logs.push(trimmed);
        }
    }
}

async fn await_pumps(
    out_pump: Option<tokio::task::JoinHandle<()>>,
    err_pump: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(handle) = out_pump {
        let _ = handle.await;
    }
    if let Some(handle) = err_pump {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(api_key: &str) -> ProviderConfig {
        ProviderConfig {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "test-model".to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn quick_supervisor() -> TaskSupervisor {
        TaskSupervisor::with_delays(Duration::from_millis(1), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn empty_task_is_rejected_without_spawning() {
        let supervisor = quick_supervisor();
        let err = supervisor
            .start("   ", "bigmodel", provider("key"))
            .unwrap_err();
        assert!(matches!(err, StartError::EmptyTask));
        assert!(!supervisor.status().running);
        assert!(supervisor.status().logs.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_is_rejected_for_keyed_provider() {
        let supervisor = quick_supervisor();
        let err = supervisor
            .start("open the mail app", "bigmodel", provider(""))
            .unwrap_err();
        assert!(matches!(err, StartError::CredentialMissing(_)));
        assert!(!supervisor.status().running);
    }

    #[tokio::test]
    async fn keyless_provider_is_exempt_from_credential_check() {
        let supervisor = quick_supervisor();
        supervisor
            .start("open the mail app", "custom", provider(""))
            .unwrap();
        assert!(supervisor.status().running);
        // The worker runs against a missing agent and terminates on its own.
        for _ in 0..200 {
            if !supervisor.status().running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let status = supervisor.status();
        assert!(!status.running, "record must never stay running");
        assert!(status.result.is_some());
    }

    #[tokio::test]
    async fn start_while_running_is_rejected_and_record_untouched() {
        let supervisor = quick_supervisor();
        {
            let mut record = supervisor.record.lock().unwrap();
            record.running = true;
            record.logs.push("existing".to_string());
        }
        let err = supervisor
            .start("another task", "custom", provider(""))
            .unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunning));
        let status = supervisor.status();
        assert_eq!(status.logs, vec!["existing".to_string()]);
        assert!(status.running);
    }

    #[tokio::test]
    async fn running_conflict_outranks_other_validation() {
        let supervisor = quick_supervisor();
        supervisor.record.lock().unwrap().running = true;
        // Empty text and a missing credential, yet the busy supervisor is
        // what the caller must hear about.
        let err = supervisor.start("   ", "bigmodel", provider("")).unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunning));
    }

    #[tokio::test]
    async fn clear_while_running_is_a_conflict() {
        let supervisor = quick_supervisor();
        supervisor.record.lock().unwrap().running = true;
        assert!(supervisor.clear().is_err());
        assert!(supervisor.status().running);
    }

    #[tokio::test]
    async fn clear_resets_terminal_state() {
        let supervisor = quick_supervisor();
        {
            let mut record = supervisor.record.lock().unwrap();
            record.logs.push("old line".to_string());
            record.result = Some(TaskResult {
                success: false,
                message: "task failed".to_string(),
            });
        }
        supervisor.clear().unwrap();
        let status = supervisor.status();
        assert!(!status.running);
        assert!(status.logs.is_empty());
        assert!(status.result.is_none());
        assert_eq!(status.total_logs, 0);
    }

    #[tokio::test]
    async fn stop_without_task_reports_false() {
        let supervisor = quick_supervisor();
        assert!(!supervisor.stop());
    }
}
