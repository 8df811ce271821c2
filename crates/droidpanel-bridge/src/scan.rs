use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;
use walkdir::WalkDir;

use crate::command::run_command;
use crate::device::adb_path;

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SKIP_DIRS: &[&str] = &["node_modules", ".git", "__pycache__", "venv", "target"];

#[derive(Clone, Debug, Serialize)]
pub struct FoundBinary {
    pub path: String,
    pub version: String,
    pub is_ours: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub our_path: String,
    pub found: Vec<FoundBinary>,
    pub has_conflict: bool,
}

/// Common places a second adb copy ends up and then fights ours over the
/// server socket.
pub fn default_scan_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        roots.push(home.join("Desktop"));
        roots.push(home.join("Downloads"));
        roots.push(home.join(".local"));
        roots.push(home.join("Android/Sdk/platform-tools"));
    }
    roots.push(PathBuf::from("/usr/local"));
    roots.push(PathBuf::from("/opt"));
    roots
}

/// Path key for de-duplication, insensitive to case and separator style.
pub fn normalize_for_compare(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

fn is_bridge_binary(name: &str) -> bool {
    name == "adb" || name.eq_ignore_ascii_case("adb.exe")
}

async fn binary_version(path: &Path) -> String {
    let result = run_command(path, &["version"], VERSION_PROBE_TIMEOUT).await;
    if result.success {
        if let Some(line) = result.stdout.lines().next() {
            return line.to_string();
        }
    }
    "unknown version".to_string()
}

/// Walks the given roots looking for every copy of the bridge binary,
/// recording each with its self-reported version. Permission-denied
/// subtrees are skipped, never fatal. Any copy other than ours is a
/// conflict indicator.
pub async fn scan_binaries(roots: &[PathBuf]) -> ScanReport {
    let our_path = adb_path();
    let our_key = normalize_for_compare(&our_path);

    let mut found = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    if our_path.exists() {
        found.push(FoundBinary {
            path: our_path.to_string_lossy().to_string(),
            version: binary_version(&our_path).await,
            is_ours: true,
        });
        seen.insert(our_key.clone());
    }

    for root in roots {
        if !root.exists() {
            continue;
        }
        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !SKIP_DIRS.contains(&name))
                .unwrap_or(true)
        });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Unreadable subtree; keep scanning the rest.
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !is_bridge_binary(name) {
                continue;
            }
            let key = normalize_for_compare(entry.path());
            if !seen.insert(key) {
                continue;
            }
            found.push(FoundBinary {
                path: entry.path().to_string_lossy().to_string(),
                version: binary_version(entry.path()).await,
                is_ours: false,
            });
        }
    }

    let has_conflict = found.iter().any(|binary| !binary.is_ours);
    ScanReport {
        our_path: our_path.to_string_lossy().to_string(),
        found,
        has_conflict,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn normalization_ignores_case_and_separators() {
        assert_eq!(
            normalize_for_compare(Path::new("C:\\Tools\\ADB.exe")),
            normalize_for_compare(Path::new("c:/tools/adb.exe"))
        );
    }

    #[test]
    fn recognizes_binary_names() {
        assert!(is_bridge_binary("adb"));
        assert!(is_bridge_binary("ADB.EXE"));
        assert!(!is_bridge_binary("fastboot"));
        assert!(!is_bridge_binary("adbkeyboard.apk"));
    }

    #[tokio::test]
    async fn finds_and_flags_foreign_copies() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("tools/platform-tools");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("adb"), b"#!/bin/sh\n").unwrap();
        fs::write(nested.join("fastboot"), b"#!/bin/sh\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/adb"), b"").unwrap();

        let report = scan_binaries(&[dir.path().to_path_buf()]).await;
        let foreign: Vec<_> = report.found.iter().filter(|b| !b.is_ours).collect();
        assert_eq!(foreign.len(), 1, "skip dirs must be pruned");
        assert!(foreign[0].path.ends_with("adb"));
        assert!(report.has_conflict);
    }

    #[tokio::test]
    async fn missing_roots_are_skipped() {
        let report = scan_binaries(&[PathBuf::from("/droidpanel-no-such-root")]).await;
        assert!(report.found.iter().all(|b| b.is_ours));
    }
}
