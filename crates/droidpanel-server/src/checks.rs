use std::time::Duration;

use serde::Serialize;

use droidpanel_bridge::command::{run_command, CommandResult};
use droidpanel_bridge::device::{adb_command, adb_path, adb_version, parse_device_lines};
use droidpanel_bridge::{keyboard_status, Device, DeviceQuery};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Python modules the agent imports at startup.
pub const REQUIRED_MODULES: &[&str] = &["PIL", "openai", "requests"];

#[derive(Serialize)]
pub struct RuntimeCheck {
    pub installed: bool,
    pub version: Option<String>,
    pub message: String,
}

pub async fn check_runtime() -> RuntimeCheck {
    let python = droidpanel_util::python_command();
    let result = run_command(&python, &["--version"], PROBE_TIMEOUT).await;
    if result.success {
        // Some interpreters print the version banner on stderr.
        let version = if result.stdout.is_empty() {
            result.stderr.clone()
        } else {
            result.stdout.clone()
        };
        RuntimeCheck {
            installed: true,
            message: format!("Python is installed: {version}"),
            version: Some(version),
        }
    } else {
        RuntimeCheck {
            installed: false,
            version: None,
            message: "Python is not installed".to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct DependencyCheck {
    pub installed: Vec<String>,
    pub missing: Vec<String>,
    pub all_installed: bool,
    pub message: String,
}

pub async fn check_dependencies() -> DependencyCheck {
    let python = droidpanel_util::python_command();
    let mut installed = Vec::new();
    let mut missing = Vec::new();
    for module in REQUIRED_MODULES {
        let probe = format!("import {module}");
        let result = run_command(&python, &["-c", &probe], PROBE_TIMEOUT).await;
        if result.success {
            installed.push(module.to_string());
        } else {
            missing.push(module.to_string());
        }
    }
    let all_installed = missing.is_empty();
    let message = if all_installed {
        "all dependencies are installed".to_string()
    } else {
        format!("missing dependencies: {}", missing.join(", "))
    };
    DependencyCheck {
        installed,
        missing,
        all_installed,
        message,
    }
}

pub async fn install_dependencies() -> Result<CommandResult, String> {
    let requirements = droidpanel_util::agent_dir().join("requirements.txt");
    if !requirements.exists() {
        return Err(format!("{} does not exist", requirements.display()));
    }
    let requirements = requirements.to_string_lossy().to_string();
    Ok(run_command(
        "pip",
        &["install", "-r", &requirements],
        INSTALL_TIMEOUT,
    )
    .await)
}

#[derive(Serialize)]
pub struct AgentCheck {
    pub installed: bool,
    pub path: String,
    pub message: String,
}

pub async fn check_agent() -> AgentCheck {
    let dir = droidpanel_util::agent_dir();
    let main_py = dir.join("main.py");
    let phone_agent = dir.join("phone_agent");
    let installed = main_py.exists() && phone_agent.exists();
    AgentCheck {
        installed,
        path: dir.to_string_lossy().to_string(),
        message: if installed {
            "agent is ready".to_string()
        } else {
            "agent not found".to_string()
        },
    }
}

#[derive(Serialize)]
pub struct PlatformToolsCheck {
    pub installed: bool,
    pub path: String,
    pub version: Option<String>,
    pub message: String,
}

pub async fn check_platform_tools() -> PlatformToolsCheck {
    let path = adb_path();
    if !path.exists() {
        return PlatformToolsCheck {
            installed: false,
            path: path.to_string_lossy().to_string(),
            version: None,
            message: "platform-tools not found".to_string(),
        };
    }
    let version = adb_version().await;
    let message = match version.as_deref() {
        Some(version) => format!("adb is ready: {version}"),
        None => "adb found but its version probe failed".to_string(),
    };
    PlatformToolsCheck {
        installed: true,
        path: path.to_string_lossy().to_string(),
        version,
        message,
    }
}

#[derive(Serialize)]
pub struct KeyboardReport {
    pub installed: bool,
    pub enabled: bool,
    pub ime_list: Vec<String>,
}

/// Aggregate diagnostics for the troubleshooting page.
#[derive(Serialize)]
pub struct BridgeStatusReport {
    pub adb_path: String,
    pub adb_exists: bool,
    pub adb_version: Option<String>,
    pub server_running: bool,
    pub devices: Vec<Device>,
    pub keyboard: KeyboardReport,
}

pub async fn bridge_status() -> BridgeStatusReport {
    let path = adb_path();
    let version = adb_version().await;

    let query = query_devices_direct().await;
    let server_running = query.result.success;
    let devices = query.devices;

    let keyboard = if devices.is_empty() {
        KeyboardReport {
            installed: false,
            enabled: false,
            ime_list: Vec::new(),
        }
    } else {
        let status = keyboard_status().await;
        KeyboardReport {
            installed: status.installed,
            enabled: status.enabled,
            ime_list: status.ime_list,
        }
    };

    BridgeStatusReport {
        adb_exists: path.exists(),
        adb_path: path.to_string_lossy().to_string(),
        adb_version: version,
        server_running,
        devices,
        keyboard,
    }
}

/// Plain enumeration without the conflict-recovery path; the diagnostics
/// page wants to see the raw server behavior.
async fn query_devices_direct() -> DeviceQuery {
    let result = adb_command(&["devices"], Duration::from_secs(10)).await;
    let devices = if result.success {
        parse_device_lines(&result.stdout)
    } else {
        Vec::new()
    };
    DeviceQuery { result, devices }
}
