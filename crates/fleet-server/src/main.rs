mod cli;
mod logging;

use anyhow::Context;
use clap::Parser;
use fleet_server::completion::spawn_stalled_sweeper;
use fleet_server::config::ServerConfig;
use fleet_server::store::Store;
use fleet_server::{router, AppState};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::Args;
use crate::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _file_guard = init_tracing(&args.log_dir, args.log_to_stderr)?;

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let listen_addr = args
        .listen_addr
        .clone()
        .unwrap_or_else(|| config.listen_addr.clone());
    info!(
        listen_addr = %listen_addr,
        config = %args.config.display(),
        database = %config.database.display(),
        hosts = config.hosts.len(),
        operators = config.operators.len(),
        "fleet server starting"
    );

    let store = Store::open(&config.database)
        .with_context(|| format!("failed to open database {}", config.database.display()))?;
    let state = AppState::from_config(&config, store);
    let shutdown = CancellationToken::new();
    let sweeper = spawn_stalled_sweeper(
        state.completion.clone(),
        Duration::from_secs(config.queue.sweep_interval_secs.max(1)),
        state.settings.stalled_after,
        shutdown.clone(),
    );

    let app = router(state);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "fleet server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await?;
    info!("fleet server shutting down");
    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
