use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use cybershield_rs::{
    adapters::HttpScannerClient, api, build_state, clock::SystemClock, config::AppConfig,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = AppConfig::load()?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid host/port")?;
    if config.api_tokens.is_empty() {
        warn!("no api tokens configured; every authenticated request will be rejected");
    }

    let scanner = Arc::new(HttpScannerClient::new(&config.scanner_url)?);
    info!(scanner_url = %config.scanner_url, database_url = %config.database_url, "starting");
    let state = build_state(&config, scanner, Arc::new(SystemClock)).await?;

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!(%addr, "CyberShield-RS listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}
