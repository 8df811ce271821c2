use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;

pub const DEFAULT_PANEL_ADDR: &str = "127.0.0.1:5000";

const CONFIG_FILE_NAME: &str = "config.json";

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn panel_addr() -> String {
    env_addr("DROIDPANEL_ADDR", DEFAULT_PANEL_ADDR)
}

/// Root directory for everything the panel persists or bundles:
/// config, telemetry, platform-tools, the agent checkout, APKs.
pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("DROIDPANEL_HOME") {
        return PathBuf::from(home);
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/droidpanel")
    } else {
        PathBuf::from("/tmp/droidpanel")
    }
}

pub fn config_file_path() -> PathBuf {
    data_dir().join(CONFIG_FILE_NAME)
}

pub fn platform_tools_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DROIDPANEL_PLATFORM_TOOLS") {
        return PathBuf::from(dir);
    }
    data_dir().join("platform-tools")
}

pub fn agent_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DROIDPANEL_AGENT_DIR") {
        return PathBuf::from(dir);
    }
    data_dir().join("agent")
}

pub fn apk_dir() -> PathBuf {
    data_dir().join("apk")
}

/// Interpreter used for the agent and for environment probes.
pub fn python_command() -> String {
    std::env::var("DROIDPANEL_PYTHON").unwrap_or_else(|_| "python".to_string())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        name: String,
    }

    #[test]
    fn write_json_atomic_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/sample.json");
        write_json_atomic(
            &path,
            &Sample {
                name: "panel".into(),
            },
        )
        .unwrap();
        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("\"panel\""));
        assert!(!path.with_extension("json.tmp").exists());
    }
}
