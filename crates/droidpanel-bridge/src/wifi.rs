use std::{sync::OnceLock, time::Duration};

use regex::Regex;

use crate::command::CommandResult;
use crate::device::adb_command;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const SHELL_TIMEOUT: Duration = Duration::from_secs(5);
const TCPIP_TIMEOUT: Duration = Duration::from_secs(10);

/// Classification of `adb connect` output. The tool's text is not a stable
/// schema, so this is deliberately lowest-common-denominator substring
/// matching, and it stays behind this module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    Refused,
    TimedOut,
    Failed(String),
}

pub fn classify_connect_output(output: &str) -> ConnectOutcome {
    let lower = output.to_lowercase();
    if lower.contains("connected") {
        // Covers "connected to" and "already connected to".
        ConnectOutcome::Connected
    } else if lower.contains("refused") {
        ConnectOutcome::Refused
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ConnectOutcome::TimedOut
    } else {
        let trimmed = output.trim();
        ConnectOutcome::Failed(if trimmed.is_empty() {
            "connect failed".to_string()
        } else {
            trimmed.to_string()
        })
    }
}

pub async fn connect_wifi(ip: &str, port: &str) -> ConnectOutcome {
    let address = format!("{ip}:{port}");
    let result = adb_command(&["connect", &address], CONNECT_TIMEOUT).await;
    if !result.success {
        return ConnectOutcome::Failed(result.failure_message());
    }
    classify_connect_output(&result.combined_output())
}

pub async fn disconnect_wifi(device_id: Option<&str>) -> CommandResult {
    match device_id {
        Some(id) => adb_command(&["disconnect", id], SHELL_TIMEOUT).await,
        None => adb_command(&["disconnect"], SHELL_TIMEOUT).await,
    }
}

/// Switches a USB-attached device into TCP/IP listening mode. adb restarts
/// the on-device daemon and prints "restarting in TCP mode"; exit code 0
/// with no output also counts as success.
pub async fn enable_tcpip(device_id: Option<&str>, port: u16) -> Result<(), String> {
    let port_arg = port.to_string();
    let result = match device_id {
        Some(id) => adb_command(&["-s", id, "tcpip", &port_arg], TCPIP_TIMEOUT).await,
        None => adb_command(&["tcpip", &port_arg], TCPIP_TIMEOUT).await,
    };
    if !result.success {
        return Err(result.failure_message());
    }
    let output = result.combined_output();
    if output.to_lowercase().contains("restarting") || result.returncode == Some(0) {
        Ok(())
    } else {
        Err(if output.trim().is_empty() {
            "enable tcpip failed".to_string()
        } else {
            output.trim().to_string()
        })
    }
}

fn route_src_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"src\s+(\d+\.\d+\.\d+\.\d+)").unwrap())
}

fn inet_addr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").unwrap())
}

/// `ip route` output ends each wlan entry with `... scope link src <ip>`.
pub fn extract_route_src(output: &str) -> Option<String> {
    route_src_regex()
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// `ip addr show wlan0` lists `inet <ip>/<prefix>`.
pub fn extract_inet_addr(output: &str) -> Option<String> {
    inet_addr_regex()
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Two-tier device IP lookup: the route table first, then the wireless
/// interface address. Different OS builds expose one or the other.
pub async fn device_ip(device_id: Option<&str>) -> Option<String> {
    let result = match device_id {
        Some(id) => adb_command(&["-s", id, "shell", "ip", "route"], SHELL_TIMEOUT).await,
        None => adb_command(&["shell", "ip", "route"], SHELL_TIMEOUT).await,
    };
    if result.success {
        if let Some(ip) = extract_route_src(&result.stdout) {
            return Some(ip);
        }
    }

    let fallback = "ip addr show wlan0 | grep inet";
    let result = match device_id {
        Some(id) => adb_command(&["-s", id, "shell", fallback], SHELL_TIMEOUT).await,
        None => adb_command(&["shell", fallback], SHELL_TIMEOUT).await,
    };
    if result.success {
        return extract_inet_addr(&result.stdout);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_from_route_table() {
        let output = "192.168.1.0/24 dev wlan0 proto kernel scope link src 192.168.1.100";
        assert_eq!(extract_route_src(output).as_deref(), Some("192.168.1.100"));
    }

    #[test]
    fn falls_back_to_interface_address() {
        let output = "    inet 192.168.1.101/24 brd 192.168.1.255 scope global wlan0";
        assert_eq!(extract_inet_addr(output).as_deref(), Some("192.168.1.101"));
    }

    #[test]
    fn missing_ip_yields_none() {
        assert_eq!(extract_route_src("default via 10.0.0.1 dev eth0"), None);
        assert_eq!(extract_inet_addr("wlan0: <NO-CARRIER>"), None);
    }

    #[test]
    fn classifies_connect_phrases() {
        assert_eq!(
            classify_connect_output("connected to 192.168.1.50:5555"),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output("already connected to 192.168.1.50:5555"),
            ConnectOutcome::Connected
        );
        assert_eq!(
            classify_connect_output("failed to connect: Connection refused"),
            ConnectOutcome::Refused
        );
        assert_eq!(
            classify_connect_output("failed to connect: Operation timed out"),
            ConnectOutcome::TimedOut
        );
        assert!(matches!(
            classify_connect_output("protocol fault"),
            ConnectOutcome::Failed(_)
        ));
    }
}
