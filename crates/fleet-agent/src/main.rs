mod cli;
mod logging;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_agent::client::ServerClient;
use fleet_agent::config::AgentConfig;
use fleet_agent::executor::SystemExecutor;
use fleet_agent::heartbeat::run_heartbeat_loop;
use fleet_agent::runner::{CommandRunner, RunnerSettings};
use fleet_agent::AGENT_VERSION;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::Args;
use crate::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_to_stderr, args.json_logs)?;

    let config = AgentConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    info!(
        version = AGENT_VERSION,
        server_url = %config.server_url,
        interval = %humantime::format_duration(config.report_interval()),
        "fleet agent starting"
    );

    let client = ServerClient::new(&config)?;
    let shutdown = CancellationToken::new();
    let (runner, worker) = CommandRunner::spawn(
        Arc::new(SystemExecutor),
        Arc::new(client.clone()),
        RunnerSettings::from_config(&config),
        shutdown.clone(),
    );
    let heartbeat = tokio::spawn(run_heartbeat_loop(
        client,
        runner,
        config.report_interval(),
        shutdown.clone(),
    ));

    wait_for_shutdown(shutdown.clone()).await;
    let _ = heartbeat.await;
    // The command in progress, if any, runs to completion or timeout.
    let _ = worker.await;
    info!("fleet agent stopped");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}
