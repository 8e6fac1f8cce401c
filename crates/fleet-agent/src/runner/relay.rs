use std::sync::Arc;
use std::time::Duration;

use protocol::CommandId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::CommandReporter;

const RELAY_QUEUE: usize = 256;
/// How long queued chunks may keep flowing once the command is done.
const RELAY_DRAIN: Duration = Duration::from_secs(2);

/// Live chunk delivery for one command, off the execution path. Chunks that
/// do not fit in the queue are dropped.
pub(super) struct ChunkRelay {
    id: CommandId,
    queue: mpsc::Sender<String>,
    task: JoinHandle<()>,
    dropped: usize,
}

impl ChunkRelay {
    pub(super) fn spawn(id: CommandId, reporter: &Arc<dyn CommandReporter>) -> Self {
        Self::with_capacity(id, reporter, RELAY_QUEUE)
    }

    fn with_capacity(id: CommandId, reporter: &Arc<dyn CommandReporter>, capacity: usize) -> Self {
        let (queue, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let reporter = Arc::clone(reporter);
        let task = tokio::spawn(async move {
            let mut failures = 0usize;
            while let Some(chunk) = rx.recv().await {
                if let Err(err) = reporter.relay_chunk(id, &chunk).await {
                    failures += 1;
                    if failures == 1 {
                        tracing::warn!(
                            event = "command.relay_failed",
                            command_id = %id,
                            error = %err,
                            "chunk relay failed"
                        );
                    }
                }
            }
            if failures > 1 {
                tracing::debug!(command_id = %id, failures, "chunk relay failures");
            }
        });
        Self {
            id,
            queue,
            task,
            dropped: 0,
        }
    }

    /// Never waits on the server.
    pub(super) fn forward(&mut self, chunk: &str) {
        if self.queue.try_send(chunk.to_string()).is_err() {
            self.dropped += 1;
        }
    }

    /// Lets already queued chunks go out, bounded by [`RELAY_DRAIN`], so they
    /// normally reach the server before the final result.
    pub(super) async fn finish(self) {
        let Self {
            id,
            queue,
            mut task,
            dropped,
        } = self;
        drop(queue);
        if dropped > 0 {
            tracing::warn!(
                event = "command.relay_dropped",
                command_id = %id,
                dropped,
                "relay queue full, live chunks dropped"
            );
        }
        if tokio::time::timeout(RELAY_DRAIN, &mut task).await.is_err() {
            task.abort();
            tracing::debug!(command_id = %id, "relay still busy, abandoning queued chunks");
        }
    }
}
