//! Everything that talks to the debug bridge binary lives here: command
//! invocation with timeouts, device enumeration and its version-conflict
//! recovery, WiFi connect, the virtual keyboard, and the conflicting-binary
//! scan. The bridge tool's textual output is its only contract, so all of
//! the substring-matching rules are kept inside this crate.

pub mod command;
pub mod device;
pub mod ime;
pub mod scan;
pub mod wifi;

pub use command::{run_command, CommandResult};
pub use device::{adb_path, query_devices, restart_server, Device, DeviceQuery, DeviceStatus};
pub use ime::{keyboard_status, KeyboardStatus, KEYBOARD_IME, KEYBOARD_PACKAGE};
pub use scan::{scan_binaries, FoundBinary, ScanReport};
pub use wifi::{connect_wifi, device_ip, disconnect_wifi, enable_tcpip, ConnectOutcome};
