use std::{net::Ipv4Addr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use droidpanel_bridge::{
    connect_wifi, device_ip, disconnect_wifi, enable_tcpip, ime, query_devices, restart_server,
    scan, ConnectOutcome, DeviceStatus,
};

use crate::checks;
use crate::config::{display_safe, ConfigStore, PanelConfig, KEYLESS_PROVIDER};
use crate::error::PanelError;
use crate::tasks::TaskSupervisor;
use crate::verify::{verify_credential, VerifyOutcome};

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub supervisor: Arc<TaskSupervisor>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            config: ConfigStore::open_default(),
            supervisor: Arc::new(TaskSupervisor::default()),
            http: reqwest::Client::new(),
        }
    }
}

fn static_dir() -> PathBuf {
    std::env::var("DROIDPANEL_STATIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("static"))
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/check/runtime", get(check_runtime))
        .route("/api/check/dependencies", get(check_dependencies))
        .route("/api/install/dependencies", post(install_dependencies))
        .route("/api/check/agent", get(check_agent))
        .route("/api/check/platform-tools", get(check_platform_tools))
        .route("/api/check/device", get(check_device))
        .route("/api/check/keyboard", get(check_keyboard))
        .route("/api/enable/keyboard", post(enable_keyboard))
        .route("/api/install/keyboard", post(install_keyboard))
        .route("/api/adb/restart", post(adb_restart))
        .route("/api/adb/scan", get(adb_scan))
        .route("/api/adb/status", get(adb_status))
        .route("/api/adb/wifi/connect", post(wifi_connect))
        .route("/api/adb/wifi/disconnect", post(wifi_disconnect))
        .route("/api/adb/wifi/enable-tcpip", post(wifi_enable_tcpip))
        .route("/api/adb/wifi/device-ip", get(wifi_device_ip))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/config/delete-key", post(delete_key))
        .route("/api/verify-key", post(verify_key))
        .route("/api/task/run", post(task_run))
        .route("/api/task/status", get(task_status))
        .route("/api/task/stop", post(task_stop))
        .route("/api/task/clear", post(task_clear))
        .fallback_service(ServeDir::new(static_dir()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ---- environment checks ----

async fn check_runtime() -> Json<Value> {
    let check = checks::check_runtime().await;
    if check.installed {
        Json(json!({
            "installed": true,
            "version": check.version,
            "message": check.message,
        }))
    } else {
        Json(json!({
            "installed": false,
            "message": check.message,
            "help": "install Python 3.10+ from https://www.python.org/downloads/ and make sure it is on PATH",
        }))
    }
}

async fn check_dependencies() -> Json<checks::DependencyCheck> {
    Json(checks::check_dependencies().await)
}

async fn install_dependencies() -> Result<Json<Value>, PanelError> {
    let result = checks::install_dependencies()
        .await
        .map_err(PanelError::BadRequest)?;
    Ok(Json(json!({
        "success": result.success,
        "output": result.combined_output(),
        "error": result.error,
    })))
}

async fn check_agent() -> Json<checks::AgentCheck> {
    Json(checks::check_agent().await)
}

async fn check_platform_tools() -> Json<checks::PlatformToolsCheck> {
    Json(checks::check_platform_tools().await)
}

// ---- device diagnostics ----

const NO_DEVICE_HELP: [&str; 4] = [
    "1. connect the phone to this machine over USB",
    "2. enable developer mode (tap the build number seven times)",
    "3. enable USB debugging in developer options",
    "4. accept the authorization prompt on the phone",
];

async fn check_device() -> Json<Value> {
    // A freshly booted machine may not have the server up yet.
    let _ = droidpanel_bridge::device::start_server().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let query = query_devices().await;
    if !query.result.success {
        return Json(json!({
            "connected": false,
            "devices": [],
            "message": "unable to run the adb command",
            "error": query.result.failure_message(),
            "help": ["a conflicting adb version may be running; retry the check"],
        }));
    }

    if query.devices.is_empty() {
        return Json(json!({
            "connected": false,
            "devices": [],
            "message": "no device detected",
            "help": NO_DEVICE_HELP,
        }));
    }

    let unauthorized = query
        .devices
        .iter()
        .any(|device| device.status == DeviceStatus::Unauthorized);
    if unauthorized {
        return Json(json!({
            "connected": true,
            "authorized": false,
            "devices": query.devices,
            "message": "device connected but not authorized",
            "help": ["accept the USB debugging prompt on the phone and check 'always allow'"],
        }));
    }

    let online = query.devices.iter().filter(|d| d.is_online()).count();
    Json(json!({
        "connected": true,
        "authorized": true,
        "devices": query.devices,
        "message": format!("{online} device(s) connected"),
    }))
}

async fn check_keyboard() -> Json<Value> {
    let apk_path = droidpanel_util::apk_dir().join("ADBKeyboard.apk");
    let apk_exists = apk_path.exists();
    let status = ime::keyboard_status().await;

    if !status.device_connected {
        return Json(json!({
            "installed": false,
            "enabled": false,
            "device_connected": false,
            "apk_exists": apk_exists,
            "apk_path": apk_path.to_string_lossy(),
            "message": "connect a phone first",
        }));
    }
    if !status.installed {
        return Json(json!({
            "installed": false,
            "enabled": false,
            "device_connected": true,
            "apk_exists": apk_exists,
            "apk_path": apk_path.to_string_lossy(),
            "message": "the keyboard app is not installed on the phone",
        }));
    }
    if status.enabled {
        Json(json!({
            "installed": true,
            "enabled": true,
            "device_connected": true,
            "apk_exists": apk_exists,
            "message": "keyboard installed and enabled",
        }))
    } else {
        Json(json!({
            "installed": true,
            "enabled": false,
            "device_connected": true,
            "apk_exists": apk_exists,
            "can_enable": true,
            "message": "keyboard installed but not enabled",
            "help": [
                "use the enable button below,",
                "or enable it on the phone:",
                "Settings -> System -> Languages & input -> Virtual keyboard -> Manage keyboards",
            ],
        }))
    }
}

async fn enable_keyboard() -> Json<Value> {
    match ime::enable_keyboard().await {
        Ok(()) => Json(json!({
            "success": true,
            "message": "keyboard enabled and selected as the current input method",
        })),
        Err(error) => Json(json!({
            "success": false,
            "error": error,
            "help": "enable it manually: Settings -> Languages & input -> Virtual keyboard -> Manage keyboards",
        })),
    }
}

async fn install_keyboard() -> Json<Value> {
    let apk_path = droidpanel_util::apk_dir().join("ADBKeyboard.apk");
    if !apk_path.exists() {
        return Json(json!({
            "success": false,
            "error": format!("APK not found: {}", apk_path.display()),
        }));
    }

    let result = ime::install_keyboard(&apk_path).await;
    if result.success || result.stdout.contains("Success") {
        Json(json!({
            "success": true,
            "message": "keyboard installed; enable it on the phone",
            "next_steps": [
                "1. open the phone Settings",
                "2. go to System -> Languages & input -> Virtual keyboard",
                "3. tap Manage keyboards",
                "4. turn on ADB Keyboard",
            ],
        }))
    } else {
        Json(json!({
            "success": false,
            "error": result.failure_message(),
            "output": result.stdout,
        }))
    }
}

async fn adb_restart() -> Json<Value> {
    let result = restart_server().await;
    Json(json!({
        "success": true,
        "message": "adb server restarted",
        "output": result.combined_output(),
    }))
}

async fn adb_scan() -> Json<scan::ScanReport> {
    Json(scan::scan_binaries(&scan::default_scan_roots()).await)
}

async fn adb_status() -> Json<checks::BridgeStatusReport> {
    Json(checks::bridge_status().await)
}

// ---- WiFi bridge ----

fn default_port() -> String {
    "5555".to_string()
}

#[derive(Deserialize)]
struct WifiConnectRequest {
    #[serde(default)]
    ip: String,
    #[serde(default = "default_port")]
    port: String,
}

async fn wifi_connect(Json(req): Json<WifiConnectRequest>) -> Result<Json<Value>, PanelError> {
    let ip = req.ip.trim();
    if ip.is_empty() {
        return Err(PanelError::BadRequest("device IP address is required".into()));
    }
    if ip.parse::<Ipv4Addr>().is_err() {
        return Err(PanelError::BadRequest("IP address format is invalid".into()));
    }
    let port = req.port.trim();
    if !port.parse::<u16>().is_ok_and(|p| p > 0) {
        return Err(PanelError::BadRequest(
            "port must be a number between 1 and 65535".into(),
        ));
    }

    let address = format!("{ip}:{port}");
    match connect_wifi(ip, port).await {
        ConnectOutcome::Connected => Ok(Json(json!({
            "success": true,
            "message": format!("connected to {address}"),
            "device_id": address,
        }))),
        ConnectOutcome::Refused => Ok(Json(json!({
            "success": false,
            "error": "connection refused",
            "help": [
                "make sure wireless debugging is enabled on the phone",
                "check the IP and port",
                "both ends must be on the same WiFi network",
            ],
        }))),
        ConnectOutcome::TimedOut => Ok(Json(json!({
            "success": false,
            "error": "connection timed out",
            "help": [
                "check the IP address",
                "both ends must be on the same WiFi network",
                "check firewall settings",
            ],
        }))),
        ConnectOutcome::Failed(error) => Ok(Json(json!({
            "success": false,
            "error": error,
        }))),
    }
}

#[derive(Deserialize, Default)]
struct DisconnectRequest {
    #[serde(default)]
    device_id: String,
}

async fn wifi_disconnect(Json(req): Json<DisconnectRequest>) -> Json<Value> {
    let device_id = req.device_id.trim();
    let result = disconnect_wifi((!device_id.is_empty()).then_some(device_id)).await;
    if result.success {
        Json(json!({"success": true, "message": "disconnected"}))
    } else {
        Json(json!({"success": false, "error": result.failure_message()}))
    }
}

#[derive(Deserialize, Default)]
struct TcpipRequest {
    #[serde(default)]
    device_id: String,
    #[serde(default = "default_tcpip_port")]
    port: u16,
}

fn default_tcpip_port() -> u16 {
    5555
}

async fn wifi_enable_tcpip(Json(req): Json<TcpipRequest>) -> Json<Value> {
    let device_id = req.device_id.trim();
    let device_id = (!device_id.is_empty()).then_some(device_id);
    match enable_tcpip(device_id, req.port).await {
        Ok(()) => {
            // Give the on-device daemon a moment before asking for its IP.
            tokio::time::sleep(Duration::from_secs(1)).await;
            let ip = device_ip(device_id).await;
            Json(json!({
                "success": true,
                "message": format!("TCP/IP mode enabled on port {}", req.port),
                "port": req.port,
                "device_ip": ip,
            }))
        }
        Err(error) => Json(json!({"success": false, "error": error})),
    }
}

#[derive(Deserialize, Default)]
struct DeviceIpQuery {
    #[serde(default)]
    device_id: String,
}

async fn wifi_device_ip(Query(query): Query<DeviceIpQuery>) -> Json<Value> {
    let device_id = query.device_id.trim();
    match device_ip((!device_id.is_empty()).then_some(device_id)).await {
        Some(ip) => Json(json!({"success": true, "ip": ip})),
        None => Json(json!({
            "success": false,
            "error": "unable to determine the device IP; make sure it is on WiFi",
        })),
    }
}

// ---- credential management ----

async fn get_config(State(state): State<AppState>) -> Json<crate::config::SafeConfig> {
    Json(display_safe(&state.config.load()))
}

#[derive(Deserialize)]
struct UpdateConfigRequest {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
}

async fn update_config(
    State(state): State<AppState>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<Json<Value>, PanelError> {
    let mut config = state.config.load();
    let provider = req
        .provider
        .clone()
        .unwrap_or_else(|| config.current_provider.clone());
    if req.provider.is_some() {
        config.current_provider = provider.clone();
    }

    let slot = config.providers.entry(provider).or_default();
    if let Some(api_key) = req.api_key {
        slot.api_key = api_key;
    }
    if let Some(base_url) = req.base_url {
        slot.base_url = base_url;
    }
    if let Some(model) = req.model {
        slot.model = model;
    }

    state.config.save(&config)?;
    Ok(Json(json!({"success": true, "message": "configuration saved"})))
}

#[derive(Deserialize, Default)]
struct DeleteKeyRequest {
    provider: Option<String>,
}

async fn delete_key(
    State(state): State<AppState>,
    Json(req): Json<DeleteKeyRequest>,
) -> Result<Json<Value>, PanelError> {
    let mut config = state.config.load();
    let provider = req
        .provider
        .unwrap_or_else(|| config.current_provider.clone());
    if let Some(slot) = config.providers.get_mut(&provider) {
        slot.api_key.clear();
    }
    state.config.save(&config)?;
    Ok(Json(json!({"success": true, "message": "API key deleted"})))
}

#[derive(Deserialize)]
struct VerifyKeyRequest {
    #[serde(default)]
    api_key: String,
    base_url: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    #[serde(default)]
    skip_verify: bool,
}

async fn verify_key(
    State(state): State<AppState>,
    Json(req): Json<VerifyKeyRequest>,
) -> Result<Json<Value>, PanelError> {
    let defaults = PanelConfig::default();
    let provider = req
        .provider
        .unwrap_or_else(|| defaults.current_provider.clone());
    let default_slot = defaults.current();
    let base_url = req.base_url.unwrap_or_else(|| default_slot.base_url.clone());
    let model = req.model.unwrap_or_else(|| default_slot.model.clone());

    // Self-hosted deployments may save without a round trip.
    if req.skip_verify || (provider == KEYLESS_PROVIDER && req.api_key.is_empty()) {
        let mut config = state.config.load();
        config.current_provider = provider.clone();
        let slot = config.providers.entry(provider).or_default();
        slot.base_url = base_url;
        slot.model = model;
        slot.api_key = req.api_key;
        state.config.save(&config)?;
        return Ok(Json(json!({
            "valid": true,
            "message": "configuration saved (API not verified)",
            "skipped_verify": true,
        })));
    }

    if req.api_key.is_empty() {
        return Ok(Json(json!({"valid": false, "error": "API key is required"})));
    }

    match verify_credential(&state.http, &base_url, &model, &req.api_key).await {
        VerifyOutcome::Valid => {
            let mut config = state.config.load();
            config.current_provider = provider.clone();
            let slot = config.providers.entry(provider).or_default();
            slot.base_url = base_url;
            slot.model = model;
            slot.api_key = req.api_key;
            state.config.save(&config)?;
            Ok(Json(json!({
                "valid": true,
                "message": "API verification succeeded",
            })))
        }
        VerifyOutcome::Invalid(error) | VerifyOutcome::Network(error) => {
            Ok(Json(json!({"valid": false, "error": error})))
        }
    }
}

// ---- task lifecycle ----

#[derive(Deserialize)]
struct RunTaskRequest {
    #[serde(default)]
    task: String,
}

async fn task_run(
    State(state): State<AppState>,
    Json(req): Json<RunTaskRequest>,
) -> Result<Json<Value>, PanelError> {
    let config = state.config.load();
    let provider_name = config.current_provider.clone();
    let provider = config.current();
    state.supervisor.start(&req.task, &provider_name, provider)?;
    droidpanel_telemetry::event("task.start", &[("provider", provider_name.as_str())]);
    Ok(Json(json!({"success": true, "message": "task started"})))
}

async fn task_status(State(state): State<AppState>) -> Json<crate::tasks::TaskSnapshot> {
    Json(state.supervisor.status())
}

async fn task_stop(State(state): State<AppState>) -> Result<Json<Value>, PanelError> {
    if state.supervisor.stop() {
        Ok(Json(json!({"success": true, "message": "stop signal sent"})))
    } else {
        Err(PanelError::Conflict("no task is running".into()))
    }
}

async fn task_clear(State(state): State<AppState>) -> Result<Json<Value>, PanelError> {
    state.supervisor.clear()?;
    Ok(Json(json!({"success": true})))
}
