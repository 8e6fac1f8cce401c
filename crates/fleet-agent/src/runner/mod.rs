mod execute;
mod output;
mod relay;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use protocol::{CommandId, CommandResult, PendingCommand, ResultAck};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, Timeouts};
use crate::executor::ActionExecutor;

const RECENT_CAPACITY: usize = 256;

/// Where the runner sends progress. Implemented over HTTP by
/// [`crate::client::ServerClient`].
#[async_trait]
pub trait CommandReporter: Send + Sync + 'static {
    async fn command_started(&self, id: CommandId) -> anyhow::Result<()>;
    async fn relay_chunk(&self, id: CommandId, chunk: &str) -> anyhow::Result<()>;
    async fn report_result(&self, result: &CommandResult) -> anyhow::Result<ResultAck>;
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub timeouts: Timeouts,
    pub max_output_bytes: usize,
    pub queue_capacity: usize,
}

impl RunnerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            timeouts: config.timeouts.timeouts(),
            max_output_bytes: usize::try_from(config.limits.max_output_bytes)
                .unwrap_or(usize::MAX),
            queue_capacity: config.limits.batch_queue_capacity.max(1),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig {
            server_url: String::new(),
            api_key: String::new(),
            report_interval_secs: 30,
            timeouts: Default::default(),
            limits: Default::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Number of commands queued; already-seen commands are skipped.
    Queued(usize),
    /// Every command was already in flight or recently finished.
    NothingNew,
    /// Queue full; the batch was dropped and will be re-delivered.
    QueueFull,
    Closed,
}

/// Commands the agent has accepted but not finished, plus a ring of recently
/// finished ones. The server keeps returning a command until its result
/// lands, so both sets are needed to never run a command twice.
#[derive(Debug, Default)]
struct DispatchTracker {
    in_flight: Vec<CommandId>,
    recent: VecDeque<CommandId>,
}

impl DispatchTracker {
    fn claim(&mut self, batch: Vec<PendingCommand>) -> Vec<PendingCommand> {
        let mut seen = HashSet::new();
        let fresh: Vec<_> = batch
            .into_iter()
            .filter(|command| {
                seen.insert(command.id)
                    && !self.in_flight.contains(&command.id)
                    && !self.recent.contains(&command.id)
            })
            .collect();
        self.in_flight.extend(fresh.iter().map(|command| command.id));
        fresh
    }

    fn release(&mut self, ids: &[CommandId]) {
        self.in_flight.retain(|id| !ids.contains(id));
    }

    fn finish(&mut self, id: CommandId) {
        self.in_flight.retain(|other| *other != id);
        if self.recent.len() == RECENT_CAPACITY {
            self.recent.pop_front();
        }
        self.recent.push_back(id);
    }
}

/// Handle to the single execution worker. Batches queue behind each other so
/// no two commands ever run at once on this host.
#[derive(Clone)]
pub struct CommandRunner {
    batches: mpsc::Sender<Vec<PendingCommand>>,
    tracker: Arc<Mutex<DispatchTracker>>,
}

impl CommandRunner {
    pub fn spawn(
        executor: Arc<dyn ActionExecutor>,
        reporter: Arc<dyn CommandReporter>,
        settings: RunnerSettings,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let tracker = Arc::new(Mutex::new(DispatchTracker::default()));
        let worker = tokio::spawn(run_worker(
            rx,
            Arc::clone(&tracker),
            executor,
            reporter,
            settings,
            shutdown,
        ));
        (
            Self {
                batches: tx,
                tracker,
            },
            worker,
        )
    }

    /// Queues a heartbeat batch without waiting for execution.
    pub fn submit(&self, batch: Vec<PendingCommand>) -> SubmitOutcome {
        let fresh = lock(&self.tracker).claim(batch);
        if fresh.is_empty() {
            return SubmitOutcome::NothingNew;
        }
        let ids: Vec<_> = fresh.iter().map(|command| command.id).collect();
        match self.batches.try_send(fresh) {
            Ok(()) => {
                tracing::info!(event = "batch.queued", commands = ids.len(), "command batch queued");
                SubmitOutcome::Queued(ids.len())
            }
            Err(err) => {
                lock(&self.tracker).release(&ids);
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(event = "batch.dropped", commands = ids.len(), "execution queue full");
                        SubmitOutcome::QueueFull
                    }
                    mpsc::error::TrySendError::Closed(_) => SubmitOutcome::Closed,
                }
            }
        }
    }

    /// Accepted commands that have not finished yet.
    pub fn in_flight(&self) -> Vec<CommandId> {
        lock(&self.tracker).in_flight.clone()
    }
}

fn lock(tracker: &Mutex<DispatchTracker>) -> std::sync::MutexGuard<'_, DispatchTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_worker(
    mut batches: mpsc::Receiver<Vec<PendingCommand>>,
    tracker: Arc<Mutex<DispatchTracker>>,
    executor: Arc<dyn ActionExecutor>,
    reporter: Arc<dyn CommandReporter>,
    settings: RunnerSettings,
    shutdown: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        for command in batch {
            let id = command.id;
            if shutdown.is_cancelled() {
                lock(&tracker).release(&[id]);
                continue;
            }
            tracing::info!(
                event = "command.started",
                command_id = %id,
                kind = %command.spec.kind,
                action = %command.spec.action,
                "executing command"
            );
            execute::run_command(command, &executor, &reporter, &settings).await;
            lock(&tracker).finish(id);
        }
    }
    tracing::info!(event = "runner.stopped", "execution worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExitOutcome;
    use protocol::{CommandKind, CommandSpec, FinalStatus, PackageStatus};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Report {
        Started(CommandId),
        Chunk(CommandId, String),
        Result(CommandResult),
    }

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<Report>>,
        fail_relay: bool,
        relay_delay: Duration,
        done: tokio::sync::Notify,
    }

    impl RecordingReporter {
        fn reports(&self) -> Vec<Report> {
            self.reports.lock().expect("reports").clone()
        }

        fn results(&self) -> Vec<CommandResult> {
            self.reports()
                .into_iter()
                .filter_map(|report| match report {
                    Report::Result(result) => Some(result),
                    _ => None,
                })
                .collect()
        }

        fn chunks(&self, id: CommandId) -> Vec<String> {
            self.reports()
                .into_iter()
                .filter_map(|report| match report {
                    Report::Chunk(chunk_id, chunk) if chunk_id == id => Some(chunk),
                    _ => None,
                })
                .collect()
        }

        async fn wait_for_results(&self, count: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.results().len() < count {
                    self.done.notified().await;
                }
            })
            .await
            .expect("results in time");
        }
    }

    #[async_trait]
    impl CommandReporter for RecordingReporter {
        async fn command_started(&self, id: CommandId) -> anyhow::Result<()> {
            self.reports.lock().expect("reports").push(Report::Started(id));
            Ok(())
        }

        async fn relay_chunk(&self, id: CommandId, chunk: &str) -> anyhow::Result<()> {
            tokio::time::sleep(self.relay_delay).await;
            self.reports
                .lock()
                .expect("reports")
                .push(Report::Chunk(id, chunk.to_string()));
            if self.fail_relay {
                anyhow::bail!("server unreachable");
            }
            Ok(())
        }

        async fn report_result(&self, result: &CommandResult) -> anyhow::Result<ResultAck> {
            self.reports
                .lock()
                .expect("reports")
                .push(Report::Result(result.clone()));
            self.done.notify_one();
            Ok(ResultAck { applied: true })
        }
    }

    /// Emits scripted chunks with a delay between them, then exits.
    struct ScriptedExecutor {
        chunks: Vec<&'static str>,
        delay: Duration,
        outcome: ExitOutcome,
        executed: Mutex<Vec<CommandId>>,
    }

    impl ScriptedExecutor {
        fn new(chunks: Vec<&'static str>, delay: Duration, outcome: ExitOutcome) -> Self {
            Self {
                chunks,
                delay,
                outcome,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            command: &PendingCommand,
            chunks: mpsc::Sender<String>,
            cancel: CancellationToken,
        ) -> anyhow::Result<ExitOutcome> {
            self.executed.lock().expect("executed").push(command.id);
            for chunk in &self.chunks {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(ExitOutcome::Cancelled),
                    _ = tokio::time::sleep(self.delay) => {}
                }
                if chunks.send(chunk.to_string()).await.is_err() {
                    return Ok(ExitOutcome::Cancelled);
                }
            }
            Ok(self.outcome.clone())
        }

        async fn package_status(&self) -> Option<PackageStatus> {
            Some(PackageStatus {
                pending_packages: 0,
                security_updates: 0,
                packages: Vec::new(),
            })
        }
    }

    fn command(id: i64, kind: CommandKind, action: &str, target: Option<&str>) -> PendingCommand {
        PendingCommand {
            id: CommandId(id),
            spec: CommandSpec {
                kind,
                action: action.to_string(),
                target: target.map(str::to_string),
                payload: serde_json::Value::Null,
            },
        }
    }

    fn restart(id: i64) -> PendingCommand {
        command(id, CommandKind::ServiceUnit, "restart", Some("nginx"))
    }

    fn start(
        executor: Arc<ScriptedExecutor>,
        reporter: Arc<RecordingReporter>,
        settings: RunnerSettings,
    ) -> (CommandRunner, JoinHandle<()>) {
        CommandRunner::spawn(executor, reporter, settings, CancellationToken::new())
    }

    #[tokio::test]
    async fn output_is_the_concatenation_of_relayed_chunks() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["Stopping nginx...\n", "Started nginx.\n"],
            Duration::from_millis(1),
            ExitOutcome::Succeeded,
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let (runner, _worker) = start(executor, Arc::clone(&reporter), RunnerSettings::default());

        assert_eq!(runner.submit(vec![restart(1)]), SubmitOutcome::Queued(1));
        reporter.wait_for_results(1).await;

        let results = reporter.results();
        assert_eq!(results[0].status, FinalStatus::Completed);
        assert_eq!(results[0].output, "Stopping nginx...\nStarted nginx.\n");
        assert_eq!(reporter.chunks(CommandId(1)).concat(), results[0].output);
        assert_eq!(reporter.reports()[0], Report::Started(CommandId(1)));
        assert!(results[0].package_status.is_none());
    }

    #[tokio::test]
    async fn batches_run_sequentially_in_order() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["a\n", "b\n"],
            Duration::from_millis(5),
            ExitOutcome::Succeeded,
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let (runner, _worker) = start(
            Arc::clone(&executor),
            Arc::clone(&reporter),
            RunnerSettings::default(),
        );

        runner.submit(vec![restart(1), restart(2)]);
        runner.submit(vec![restart(3)]);
        reporter.wait_for_results(3).await;

        assert_eq!(
            *executor.executed.lock().expect("executed"),
            vec![CommandId(1), CommandId(2), CommandId(3)]
        );
        // Each command's reports are contiguous: no overlap between commands.
        let order: Vec<CommandId> = reporter
            .reports()
            .into_iter()
            .map(|report| match report {
                Report::Started(id) | Report::Chunk(id, _) => id,
                Report::Result(result) => result.command_id,
            })
            .collect();
        let mut runs = order.clone();
        runs.dedup();
        assert_eq!(runs, vec![CommandId(1), CommandId(2), CommandId(3)]);
    }

    #[tokio::test]
    async fn invalid_target_never_reaches_executor() {
        let executor = Arc::new(ScriptedExecutor::new(vec![], Duration::ZERO, ExitOutcome::Succeeded));
        let reporter = Arc::new(RecordingReporter::default());
        let (runner, _worker) = start(
            Arc::clone(&executor),
            Arc::clone(&reporter),
            RunnerSettings::default(),
        );

        runner.submit(vec![command(7, CommandKind::ServiceUnit, "restart", Some("nginx;reboot"))]);
        reporter.wait_for_results(1).await;

        assert!(executor.executed.lock().expect("executed").is_empty());
        let result = &reporter.results()[0];
        assert_eq!(result.status, FinalStatus::Failed);
        assert!(result.output.starts_with("ERROR: invalid target name"));
        assert!(!reporter.reports().contains(&Report::Started(CommandId(7))));
    }

    #[tokio::test]
    async fn relay_failures_do_not_fail_the_command() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["one\n", "two\n"],
            Duration::ZERO,
            ExitOutcome::Succeeded,
        ));
        let reporter = Arc::new(RecordingReporter {
            fail_relay: true,
            ..Default::default()
        });
        let (runner, _worker) = start(executor, Arc::clone(&reporter), RunnerSettings::default());

        runner.submit(vec![restart(1)]);
        reporter.wait_for_results(1).await;
        let result = &reporter.results()[0];
        assert_eq!(result.status, FinalStatus::Completed);
        assert_eq!(result.output, "one\ntwo\n");
    }

    #[tokio::test]
    async fn slow_relays_do_not_eat_the_time_budget() {
        let lines: Vec<&'static str> = (0..20)
            .map(|n| &*Box::leak(format!("line {n}\n").into_boxed_str()))
            .collect();
        let expected = lines.concat();
        let executor = Arc::new(ScriptedExecutor::new(lines, Duration::ZERO, ExitOutcome::Succeeded));
        let reporter = Arc::new(RecordingReporter {
            fail_relay: true,
            relay_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let mut settings = RunnerSettings::default();
        settings.timeouts.service = Duration::from_millis(500);
        let (runner, _worker) = start(executor, Arc::clone(&reporter), settings);

        runner.submit(vec![restart(1)]);
        reporter.wait_for_results(1).await;
        let result = &reporter.results()[0];
        assert_eq!(result.status, FinalStatus::Completed);
        assert!(!result.timed_out);
        assert_eq!(result.output, expected);
    }

    #[tokio::test]
    async fn timeout_fails_and_stops_relaying() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["first\n", "second\n", "third\n"],
            Duration::from_millis(80),
            ExitOutcome::Succeeded,
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let mut settings = RunnerSettings::default();
        settings.timeouts.service = Duration::from_millis(120);
        let (runner, _worker) = start(executor, Arc::clone(&reporter), settings);

        runner.submit(vec![restart(1)]);
        reporter.wait_for_results(1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = &reporter.results()[0];
        assert_eq!(result.status, FinalStatus::Failed);
        assert!(result.timed_out);
        assert!(result.output.starts_with("first\n"));
        assert!(result.output.ends_with("[timed out after 120ms]"));
        // Nothing relayed once the result went out.
        let last = reporter.reports().last().cloned();
        assert!(matches!(last, Some(Report::Result(_))));
        assert_eq!(reporter.chunks(CommandId(1)), vec!["first\n".to_string()]);
    }

    #[tokio::test]
    async fn failed_exit_prefixes_error() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["E: Could not get lock\n"],
            Duration::ZERO,
            ExitOutcome::Failed {
                detail: "apt-get exited with exit status: 100".to_string(),
            },
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let (runner, _worker) = start(executor, Arc::clone(&reporter), RunnerSettings::default());

        runner.submit(vec![command(3, CommandKind::PackageManager, "upgrade", None)]);
        reporter.wait_for_results(1).await;
        let result = &reporter.results()[0];
        assert_eq!(result.status, FinalStatus::Failed);
        assert_eq!(
            result.output,
            "ERROR: apt-get exited with exit status: 100\nE: Could not get lock\n"
        );
        assert!(result.package_status.is_some());
    }

    #[tokio::test]
    async fn redelivered_commands_are_not_run_twice() {
        let executor = Arc::new(ScriptedExecutor::new(
            vec!["x\n"],
            Duration::from_millis(20),
            ExitOutcome::Succeeded,
        ));
        let reporter = Arc::new(RecordingReporter::default());
        let (runner, _worker) = start(
            Arc::clone(&executor),
            Arc::clone(&reporter),
            RunnerSettings::default(),
        );

        assert_eq!(runner.submit(vec![restart(1)]), SubmitOutcome::Queued(1));
        assert_eq!(runner.submit(vec![restart(1)]), SubmitOutcome::NothingNew);
        assert_eq!(runner.in_flight(), vec![CommandId(1)]);
        reporter.wait_for_results(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runner.in_flight().is_empty());
        assert_eq!(runner.submit(vec![restart(1)]), SubmitOutcome::NothingNew);
        assert_eq!(executor.executed.lock().expect("executed").len(), 1);
    }

    #[test]
    fn full_queue_releases_the_batch() {
        let (tx, _rx) = mpsc::channel(1);
        let runner = CommandRunner {
            batches: tx,
            tracker: Arc::new(Mutex::new(DispatchTracker::default())),
        };
        assert_eq!(runner.submit(vec![restart(1)]), SubmitOutcome::Queued(1));
        assert_eq!(runner.submit(vec![restart(2)]), SubmitOutcome::QueueFull);
        assert_eq!(runner.in_flight(), vec![CommandId(1)]);
    }

    #[test]
    fn recent_ring_is_bounded() {
        let mut tracker = DispatchTracker::default();
        for id in 0..(RECENT_CAPACITY as i64 + 10) {
            tracker.claim(vec![restart(id)]);
            tracker.finish(CommandId(id));
        }
        assert_eq!(tracker.recent.len(), RECENT_CAPACITY);
        assert!(tracker.in_flight.is_empty());
        assert_eq!(tracker.claim(vec![restart(0)]).len(), 1);
    }
}
