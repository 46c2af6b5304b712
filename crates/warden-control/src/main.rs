use anyhow::Context;
use tracing_subscriber::prelude::*;

use warden_control::listener::AgentListener;
use warden_control::registry::Registry;
use warden_control::state::AppState;
use warden_control::http_api;

fn env_addr(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = Registry::new();

    // TCP listener for agents (outbound agent -> command server).
    let agent_addr = env_addr("WARDEN_AGENT_LISTEN_ADDR", "0.0.0.0:9090");
    let agent_listener = AgentListener::bind(&agent_addr, registry.clone()).await?;
    tokio::spawn(async move {
        if let Err(err) = agent_listener.serve().await {
            tracing::error!(error = %err, "agent listener failed");
            std::process::exit(1);
        }
    });

    // HTTP API for operators.
    let http_addr = env_addr("WARDEN_HTTP_ADDR", "0.0.0.0:8080");
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("bind http api on {http_addr}"))?;
    tracing::info!(addr = %http_addr, "http api listening");

    let app = http_api::router(AppState { registry });
    axum::serve(http_listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    tracing::info!("stopped cleanly");
    Ok(())
}
