use std::time::Duration;

use protocol::HeartbeatReport;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::client::ServerClient;
use crate::runner::{CommandRunner, SubmitOutcome};
use crate::snapshot::collect_host_snapshot;
use crate::AGENT_VERSION;

/// Reports on a fixed interval and hands returned commands to the runner.
/// Never waits on command execution.
pub async fn run_heartbeat_loop(
    client: ServerClient,
    runner: CommandRunner,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(
        event = "heartbeat.started",
        interval = %humantime::format_duration(interval),
        "heartbeat loop running"
    );
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = HeartbeatReport {
            agent_version: AGENT_VERSION.to_string(),
            host: collect_host_snapshot().await,
            in_flight: runner.in_flight(),
        };
        let response = match client.heartbeat_with_retry(&report, &shutdown).await {
            None => break,
            Some(Ok(response)) => response,
            Some(Err(err)) => {
                tracing::warn!(event = "heartbeat.failed", error = %err, "heartbeat failed");
                continue;
            }
        };
        let offered = response.commands.len();
        match runner.submit(response.commands) {
            SubmitOutcome::Queued(queued) => {
                tracing::info!(event = "heartbeat.commands", offered, queued, "received commands");
            }
            SubmitOutcome::NothingNew => {
                if offered > 0 {
                    tracing::debug!(offered, "all pending commands already accepted");
                }
            }
            SubmitOutcome::QueueFull => {}
            SubmitOutcome::Closed => {
                tracing::warn!(event = "heartbeat.runner_closed", "execution worker is gone");
                break;
            }
        }
    }
    tracing::info!(event = "heartbeat.stopped", "heartbeat loop stopped");
}
