mod checks;
mod config;
mod error;
mod routes;
mod tasks;
mod verify;

use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    droidpanel_util::init_tracing()?;
    droidpanel_telemetry::init("droidpanel", env!("CARGO_PKG_VERSION"));
    droidpanel_telemetry::event("service.start", &[("version", env!("CARGO_PKG_VERSION"))]);

    let state = routes::AppState::new();
    let app = routes::router(state);

    let addr = droidpanel_util::panel_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "control panel listening");
    axum::serve(listener, app).await?;
    Ok(())
}
