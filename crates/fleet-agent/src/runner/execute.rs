use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{validate_command, CommandKind, CommandResult, FinalStatus, PendingCommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::executor::{ActionExecutor, ExitOutcome};

use super::output::{append_line, OutputAccumulator};
use super::relay::ChunkRelay;
use super::{CommandReporter, RunnerSettings};

const CHUNK_QUEUE: usize = 256;
/// How long a cancelled executor gets to wind down after a timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Runs one command to a final result and reports it. Never fails: every
/// error ends up in the reported output.
pub(super) async fn run_command(
    command: PendingCommand,
    executor: &Arc<dyn ActionExecutor>,
    reporter: &Arc<dyn CommandReporter>,
    settings: &RunnerSettings,
) -> CommandResult {
    let id = command.id;
    let started_at = Instant::now();
    let result = match validate_command(&command.spec) {
        Ok(()) => execute_streaming(command, executor, reporter, settings).await,
        Err(err) => {
            tracing::warn!(
                event = "command.rejected",
                command_id = %id,
                error = %err,
                "command rejected before execution"
            );
            CommandResult {
                command_id: id,
                status: FinalStatus::Failed,
                output: format!("ERROR: {err}"),
                timed_out: false,
                package_status: None,
            }
        }
    };
    tracing::info!(
        event = "command.finished",
        command_id = %id,
        status = ?result.status,
        timed_out = result.timed_out,
        output_bytes = result.output.len(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "command finished"
    );

    match reporter.report_result(&result).await {
        Ok(ack) if !ack.applied => {
            tracing::info!(event = "command.result_ignored", command_id = %id, "server already had a result");
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(
                event = "command.report_failed",
                command_id = %id,
                error = %err,
                "failed to report result"
            );
        }
    }
    result
}

async fn execute_streaming(
    command: PendingCommand,
    executor: &Arc<dyn ActionExecutor>,
    reporter: &Arc<dyn CommandReporter>,
    settings: &RunnerSettings,
) -> CommandResult {
    let id = command.id;
    let kind = command.spec.kind;
    if let Err(err) = reporter.command_started(id).await {
        tracing::debug!(command_id = %id, error = %err, "started notice failed");
    }

    let budget = settings.timeouts.for_kind(kind);
    let (tx, mut rx) = mpsc::channel::<String>(CHUNK_QUEUE);
    let cancel = CancellationToken::new();
    let mut exec_task = {
        let executor = Arc::clone(executor);
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.execute(&command, tx, cancel).await })
    };

    let mut relay = ChunkRelay::spawn(id, reporter);
    let mut output = OutputAccumulator::new(settings.max_output_bytes);
    let deadline = tokio::time::sleep(budget);
    tokio::pin!(deadline);
    let mut chunks_open = true;
    let mut joined = None;
    let mut timed_out = false;
    while chunks_open || joined.is_none() {
        tokio::select! {
            biased;
            _ = &mut deadline, if joined.is_none() => {
                timed_out = true;
                break;
            }
            chunk = rx.recv(), if chunks_open => match chunk {
                Some(chunk) => {
                    relay.forward(&chunk);
                    output.push(&chunk);
                }
                None => chunks_open = false,
            },
            result = &mut exec_task, if joined.is_none() => {
                joined = Some(result);
            }
        }
    }

    let exit = if timed_out {
        // Nothing read after this point is relayed or kept.
        cancel.cancel();
        drop(rx);
        tracing::warn!(
            event = "command.timed_out",
            command_id = %id,
            budget = %humantime::format_duration(budget),
            "command timed out"
        );
        match tokio::time::timeout(CANCEL_GRACE, &mut exec_task).await {
            Ok(result) => Some(result),
            Err(_) => {
                exec_task.abort();
                None
            }
        }
    } else {
        joined
    };
    relay.finish().await;
    let exit = match exit {
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(anyhow::anyhow!("executor task failed: {err}")),
        None => Err(anyhow::anyhow!("executor did not stop after cancellation")),
    };

    let body = output.finish();
    let (status, output) = if timed_out {
        let mut text = body;
        append_line(
            &mut text,
            &format!("[timed out after {}]", humantime::format_duration(budget)),
        );
        (FinalStatus::Failed, text)
    } else {
        match exit {
            Ok(ExitOutcome::Succeeded) => (FinalStatus::Completed, body),
            Ok(ExitOutcome::Failed { detail }) => (FinalStatus::Failed, error_output(&detail, body)),
            Ok(ExitOutcome::Cancelled) => (FinalStatus::Failed, error_output("cancelled", body)),
            Err(err) => (FinalStatus::Failed, error_output(&format!("{err:#}"), body)),
        }
    };

    let package_status = if kind == CommandKind::PackageManager {
        executor.package_status().await
    } else {
        None
    };
    CommandResult {
        command_id: id,
        status,
        output,
        timed_out,
        package_status,
    }
}

fn error_output(detail: &str, body: String) -> String {
    if body.is_empty() {
        format!("ERROR: {detail}")
    } else {
        format!("ERROR: {detail}\n{body}")
    }
}
