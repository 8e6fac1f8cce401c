use protocol::{CommandRecord, CommandResult, CommandStatus, FinalStatus, LiveStatus};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::hub::StreamHub;
use crate::store::{now_ms, ResolveOutcome, Store, StoreError};

pub const STALLED_REASON: &str = "command expired: agent may have crashed or restarted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    /// Already resolved earlier; nothing was written or broadcast.
    Duplicate,
    WrongHost,
    NotFound,
}

/// Single path through which commands reach a terminal state.
#[derive(Clone)]
pub struct CompletionHandler {
    store: Store,
    hub: StreamHub,
}

impl CompletionHandler {
    pub fn new(store: Store, hub: StreamHub) -> Self {
        Self { store, hub }
    }

    /// Resolves the command, then updates its audit entry and package
    /// snapshot (best-effort), then publishes the terminal status.
    pub async fn complete(
        &self,
        host_id: &str,
        result: CommandResult,
    ) -> Result<CompletionOutcome, StoreError> {
        let CommandResult {
            command_id,
            status,
            output,
            timed_out,
            package_status,
        } = result;
        let outcome = self
            .store
            .resolve(command_id, Some(host_id), status, output, timed_out)
            .await?;
        let record = match outcome {
            ResolveOutcome::Applied(record) => record,
            ResolveOutcome::AlreadyResolved(record) => {
                tracing::info!(
                    event = "command.duplicate_result",
                    command_id = %command_id,
                    host_id,
                    stored_status = record.status.as_str(),
                    "ignoring result for resolved command"
                );
                return Ok(CompletionOutcome::Duplicate);
            }
            ResolveOutcome::WrongHost => return Ok(CompletionOutcome::WrongHost),
            ResolveOutcome::NotFound => return Ok(CompletionOutcome::NotFound),
        };
        tracing::info!(
            event = "command.resolved",
            command_id = %command_id,
            host_id,
            status = record.status.as_str(),
            timed_out,
            output_bytes = record.output.len(),
            "command resolved"
        );

        self.finish_audit(&record).await;
        if let Some(snapshot) = package_status {
            if record.status == CommandStatus::Completed {
                if let Err(err) = self.store.upsert_package_status(host_id, snapshot).await {
                    tracing::warn!(
                        event = "package_status.update_failed",
                        host_id,
                        error = %err,
                        "failed to store package status"
                    );
                }
            }
        }
        self.broadcast(&record, status);
        Ok(CompletionOutcome::Applied)
    }

    /// Fails pending commands older than `stalled_after`, for one host or all.
    pub async fn expire_stalled(
        &self,
        host_id: Option<&str>,
        stalled_after: Duration,
    ) -> Result<usize, StoreError> {
        let window = i64::try_from(stalled_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(window);
        let expired = self
            .store
            .expire_stalled(host_id, cutoff, STALLED_REASON)
            .await?;
        for stalled in &expired {
            tracing::warn!(
                event = "command.expired",
                command_id = %stalled.record.id,
                host_id = %stalled.record.host_id,
                "stalled command marked failed"
            );
            self.finish_audit(&stalled.record).await;
            self.broadcast(&stalled.record, FinalStatus::Failed);
        }
        Ok(expired.len())
    }

    async fn finish_audit(&self, record: &CommandRecord) {
        let Some(audit_id) = record.audit_log_id else {
            return;
        };
        let (status, details) = match record.status {
            CommandStatus::Completed => ("success", ""),
            _ => ("failed", record.output.as_str()),
        };
        if let Err(err) = self.store.finish_audit(audit_id, status, details).await {
            tracing::warn!(
                event = "audit.update_failed",
                command_id = %record.id,
                audit_id,
                error = %err,
                "failed to update audit entry"
            );
        }
    }

    fn broadcast(&self, record: &CommandRecord, status: FinalStatus) {
        let outcome =
            self.hub
                .publish_status(record.id, LiveStatus::from(status), Some(record.output.clone()));
        tracing::debug!(
            event = "hub.status_published",
            command_id = %record.id,
            outcome = ?outcome,
            "terminal status published"
        );
    }
}

/// Periodically expires stalled commands across every host.
pub fn spawn_stalled_sweeper(
    handler: CompletionHandler,
    interval: Duration,
    stalled_after: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            event = "sweeper.started",
            interval = %humantime::format_duration(interval),
            stalled_after = %humantime::format_duration(stalled_after),
            "stalled command sweeper running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = handler.expire_stalled(None, stalled_after).await {
                        tracing::warn!(event = "sweeper.failed", error = %err, "stalled sweep failed");
                    }
                }
            }
        }
    })
}
