//! Server entry point: parses settings, initializes logging, wires the
//! shared state, spawns the liveness ticker, and serves until interrupted.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use routetunnel::config::Settings;
use routetunnel::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    // Default log level comes from LOG_LEVEL; RUST_LOG overrides.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.env_filter())),
        )
        .init();

    let state = AppState::new(settings);
    let ping_task = state
        .registry
        .spawn_ping_task(state.settings.ping_interval());

    let app = routetunnel::app(state.clone());
    let addr = state.settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("routetunnel listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ping_task.abort();
    state.registry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
