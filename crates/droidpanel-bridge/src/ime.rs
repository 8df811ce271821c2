use std::{path::Path, time::Duration};

use serde::Serialize;
use tracing::warn;

use crate::command::CommandResult;
use crate::device::{
    adb_command, is_version_conflict, mentions_missing_device, restart_server, SHORT_TIMEOUT,
};

/// The virtual keyboard the agent drives to inject text.
pub const KEYBOARD_PACKAGE: &str = "com.android.adbkeyboard";
pub const KEYBOARD_IME: &str = "com.android.adbkeyboard/.AdbIME";

const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const STATUS_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Default, Serialize)]
pub struct KeyboardStatus {
    pub device_connected: bool,
    pub installed: bool,
    pub enabled: bool,
    pub ime_list: Vec<String>,
}

async fn pm_path_with_retry() -> CommandResult {
    let mut result = CommandResult::default();
    for _ in 0..STATUS_ATTEMPTS {
        result = adb_command(&["shell", "pm", "path", KEYBOARD_PACKAGE], SHORT_TIMEOUT).await;

        if is_version_conflict(&result.stderr) {
            warn!("adb version conflict while probing keyboard, restarting server");
            restart_server().await;
            tokio::time::sleep(RETRY_DELAY).await;
            continue;
        }
        if !result.stdout.is_empty() || result.success {
            break;
        }
        // Transient connection trouble; give the device a moment.
        let lower = result.stderr.to_lowercase();
        if lower.contains("no devices") || lower.contains("error") {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        break;
    }
    result
}

/// Probes whether the keyboard package is installed and whether its IME is
/// enabled, surviving one round of server version conflicts.
pub async fn keyboard_status() -> KeyboardStatus {
    let pkg = pm_path_with_retry().await;

    let mut stderr = pkg.stderr.clone();
    if let Some(error) = pkg.error.as_ref() {
        stderr.push_str(error);
    }
    if mentions_missing_device(&stderr) {
        return KeyboardStatus::default();
    }

    let installed = pkg.stdout.to_lowercase().contains("package:");
    if !installed {
        return KeyboardStatus {
            device_connected: true,
            ..KeyboardStatus::default()
        };
    }

    let ime = adb_command(&["shell", "ime", "list", "-s"], SHORT_TIMEOUT).await;
    let ime_list: Vec<String> = ime
        .stdout
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    // The full IME component id must appear, matching what the agent checks.
    let enabled = ime.stdout.contains(KEYBOARD_IME);

    KeyboardStatus {
        device_connected: true,
        installed: true,
        enabled,
        ime_list,
    }
}

/// Enables the keyboard IME and selects it as current. Selection can need
/// on-device confirmation, so presence in the enabled-IME list after the
/// attempt also counts as success.
pub async fn enable_keyboard() -> Result<(), String> {
    let enable = adb_command(&["shell", "ime", "enable", KEYBOARD_IME], SHORT_TIMEOUT).await;
    if !enable.success && enable.stderr.to_lowercase().contains("error") {
        return Err(format!("enable failed: {}", enable.failure_message()));
    }

    let set = adb_command(&["shell", "ime", "set", KEYBOARD_IME], SHORT_TIMEOUT).await;
    if set.success || set.stdout.to_lowercase().contains("selected") {
        return Ok(());
    }

    let check = adb_command(&["shell", "ime", "list", "-s"], SHORT_TIMEOUT).await;
    if check.stdout.contains(KEYBOARD_PACKAGE) {
        Ok(())
    } else {
        Err("enabling may require confirmation on the device".to_string())
    }
}

/// Best-effort enable used inside the task readiness sequence; failures are
/// logged and ignored.
pub async fn try_enable_keyboard() {
    let _ = adb_command(&["shell", "ime", "enable", KEYBOARD_IME], SHORT_TIMEOUT).await;
    let _ = adb_command(&["shell", "ime", "set", KEYBOARD_IME], SHORT_TIMEOUT).await;
}

/// Installs the keyboard APK, retrying once after a server restart when a
/// version conflict or a missing device gets in the way.
pub async fn install_keyboard(apk_path: &Path) -> CommandResult {
    let apk = apk_path.to_string_lossy().to_string();
    let mut result = adb_command(&["install", "-r", &apk], INSTALL_TIMEOUT).await;

    // "version" alone is too broad here: install failures legitimately
    // mention versions (e.g. INSTALL_FAILED_VERSION_DOWNGRADE).
    let merged = format!("{}{}", result.stderr, result.stdout);
    if merged.contains("doesn't match") || merged.to_lowercase().contains("no devices") {
        warn!("adb install hit a stale server, restarting and retrying");
        restart_server().await;
        result = adb_command(&["install", "-r", &apk], INSTALL_TIMEOUT).await;
    }
    result
}
