use anyhow::{Context, Result};
use backhaul_relay::config::Args;
use backhaul_relay::{serve, AppState};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("backhaul_relay=info")),
        )
        .init();

    let config = Args::parse().into_config()?;
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    info!("Backhaul Relay on {} (backend: {})", config.bind, config.backend_url);

    let state = AppState::new(config);
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            shutdown.cancel();
        }
    });

    serve(listener, state).await
}
