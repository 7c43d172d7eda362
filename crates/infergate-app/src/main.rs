use std::net::SocketAddr;

use anyhow::Context;
use infergate_app::{AppState, build_router, config::AppConfig};
use infergate_observability::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing("infergate-app");

    let config = AppConfig::from_env().context("configuration must be valid")?;
    let state = AppState::from_config(&config)?;
    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("socket address must be valid")?;

    let listener = tokio::net::TcpListener::bind(addr).await.context("listener must bind")?;
    info!(event = "server.started", %addr, "gateway listening");
    axum::serve(listener, app).await.context("server must run")?;
    Ok(())
}
