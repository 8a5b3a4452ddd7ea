use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use dbc::config::ConfigStore;
use dbc::server::logs::LogChannel;
use dbc::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logs = LogChannel::new();

    // DBC_LOG drives verbosity; log lines go to stderr and, through the
    // broadcast writer, to every /ws/logs subscriber
    let filter = EnvFilter::try_from_env("DBC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(logs.clone()),
        )
        .init();

    let config_path =
        std::env::var("DBC_CONFIG").unwrap_or_else(|_| "dbc-connections.json".to_owned());
    let config = Arc::new(
        ConfigStore::load(&config_path)
            .await
            .with_context(|| format!("loading config from {config_path}"))?,
    );

    let state = AppState::new(config, logs);
    server::spawn_config_listener(Arc::clone(&state));

    let addr = std::env::var("ADDR").unwrap_or_else(|_| "127.0.0.1:0".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = server::router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.pools.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
}
