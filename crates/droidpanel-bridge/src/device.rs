use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use tracing::warn;

use crate::command::{run_command, CommandResult};

pub(crate) const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Resolves the bridge binary, preferring the bundled platform-tools copy
/// so a stray system-wide adb of a different version is never picked up.
pub fn adb_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDPANEL_ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("ADB_PATH") {
        return PathBuf::from(path);
    }
    let tools = droidpanel_util::platform_tools_dir();
    let candidate = tools.join("adb");
    if candidate.exists() {
        return candidate;
    }
    let candidate = tools.join("adb.exe");
    if candidate.exists() {
        return candidate;
    }
    PathBuf::from("adb")
}

pub async fn adb_command(args: &[&str], timeout: Duration) -> CommandResult {
    run_command(adb_path(), args, timeout).await
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Device,
    Unauthorized,
    Offline,
    Unknown,
}

impl DeviceStatus {
    fn from_token(token: &str) -> Self {
        match token {
            "device" => DeviceStatus::Device,
            "unauthorized" => DeviceStatus::Unauthorized,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Unknown,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Device {
    pub id: String,
    pub status: DeviceStatus,
}

impl Device {
    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Device
    }
}

/// Result of one enumeration pass: the raw command record plus whatever
/// device lines could be parsed out of it.
#[derive(Clone, Debug)]
pub struct DeviceQuery {
    pub result: CommandResult,
    pub devices: Vec<Device>,
}

impl DeviceQuery {
    pub fn any_online(&self) -> bool {
        self.devices.iter().any(Device::is_online)
    }
}

/// Lines after the "List of devices attached" header are `<id>\t<status>`;
/// anything that doesn't match is dropped silently.
pub fn parse_device_lines(output: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    for line in output.lines().skip_while(|l| !l.contains('\t')) {
        let line = line.trim();
        let Some((id, status)) = line.split_once('\t') else {
            continue;
        };
        let id = id.trim();
        if id.is_empty() {
            continue;
        }
        devices.push(Device {
            id: id.to_string(),
            status: DeviceStatus::from_token(status.trim()),
        });
    }
    devices
}

/// A stale bridge server started by another adb copy answers with a
/// version-mismatch complaint on stderr.
pub fn is_version_conflict(stderr: &str) -> bool {
    stderr.contains("doesn't match") || stderr.to_lowercase().contains("version")
}

pub(crate) fn mentions_missing_device(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no devices") || lower.contains("device not found") || lower.contains("offline")
}

/// Stop/start cycle used to recover from a version conflict. Best-effort:
/// failures along the way are logged, never propagated, since this is
/// itself the recovery path.
pub async fn restart_server() -> CommandResult {
    let kill = adb_command(&["kill-server"], SHORT_TIMEOUT).await;
    if !kill.success {
        warn!("adb kill-server failed: {}", kill.failure_message());
    }
    tokio::time::sleep(SETTLE_DELAY).await;
    let start = adb_command(&["start-server"], SERVER_START_TIMEOUT).await;
    if !start.success {
        warn!("adb start-server failed: {}", start.failure_message());
    }
    tokio::time::sleep(SETTLE_DELAY).await;
    // Trigger enumeration so the fresh server discovers devices.
    let _ = adb_command(&["devices"], SHORT_TIMEOUT).await;
    start
}

pub async fn start_server() -> CommandResult {
    adb_command(&["start-server"], SERVER_START_TIMEOUT).await
}

/// Enumerates devices, recovering once from a server version conflict.
pub async fn query_devices() -> DeviceQuery {
    let mut result = adb_command(&["devices"], SHORT_TIMEOUT).await;
    if is_version_conflict(&result.stderr) {
        warn!("adb version conflict detected, restarting server");
        restart_server().await;
        result = adb_command(&["devices"], SHORT_TIMEOUT).await;
    }
    let devices = if result.success {
        parse_device_lines(&result.stdout)
    } else {
        Vec::new()
    };
    DeviceQuery { result, devices }
}

/// First line of `adb version`, or None if the probe failed.
pub async fn adb_version() -> Option<String> {
    let result = adb_command(&["version"], Duration::from_secs(5)).await;
    if !result.success {
        return None;
    }
    result.stdout.lines().next().map(|line| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devices_after_header() {
        let output = "List of devices attached\nXYZ123\tdevice\nABC999\tunauthorized\n";
        let devices = parse_device_lines(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "XYZ123");
        assert_eq!(devices[0].status, DeviceStatus::Device);
        assert_eq!(devices[1].id, "ABC999");
        assert_eq!(devices[1].status, DeviceStatus::Unauthorized);
    }

    #[test]
    fn drops_unrecognized_lines() {
        let output = "List of devices attached\n* daemon started successfully\n\n";
        assert!(parse_device_lines(output).is_empty());
    }

    #[test]
    fn classifies_offline_and_unknown_tokens() {
        let output = "List of devices attached\nAAA\toffline\nBBB\trecovery\n";
        let devices = parse_device_lines(output);
        assert_eq!(devices[0].status, DeviceStatus::Offline);
        assert_eq!(devices[1].status, DeviceStatus::Unknown);
    }

    #[test]
    fn detects_version_conflicts() {
        assert!(is_version_conflict(
            "adb server version (41) doesn't match this client (36); killing..."
        ));
        assert!(is_version_conflict("adb server Version mismatch"));
        assert!(!is_version_conflict("error: no devices/emulators found"));
    }
}
