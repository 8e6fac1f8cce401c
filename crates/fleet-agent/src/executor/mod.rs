mod package;
mod stream;

use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use protocol::{CommandId, PackageStatus, PendingCommand};
use system_utils::process::{isolate_process_group, terminate_process_group, TERMINATE_GRACE};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::actions::{self, ActionPlan};

pub use package::{collect_package_status, parse_upgradable};

/// How long to wait for pipes to drain after the process exits. Daemons
/// forked by the command can hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Succeeded,
    Failed { detail: String },
    Cancelled,
}

/// Runs one command, sending output chunks as they are produced. Chunks
/// must be sent in the order they are read; `cancel` fires on timeout.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        command: &PendingCommand,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExitOutcome>;

    /// Package snapshot attached to package-manager results.
    async fn package_status(&self) -> Option<PackageStatus> {
        None
    }
}

/// Executes commands as local processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

#[async_trait]
impl ActionExecutor for SystemExecutor {
    async fn execute(
        &self,
        command: &PendingCommand,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExitOutcome> {
        let plan = actions::plan(&command.spec)?;
        run_plan(command.id, &plan, chunks, cancel).await
    }

    async fn package_status(&self) -> Option<PackageStatus> {
        match collect_package_status().await {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::warn!(event = "package_status.failed", error = %err, "package status unavailable");
                None
            }
        }
    }
}

/// Spawns `plan` in its own process group and streams stdout and stderr
/// through two readers sharing `chunks`. Chunks are forwarded in arrival
/// order; each pipe keeps its own order but the two may interleave.
async fn run_plan(
    id: CommandId,
    plan: &ActionPlan,
    chunks: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> anyhow::Result<ExitOutcome> {
    tracing::debug!(
        event = "command.spawn",
        command_id = %id,
        command = %plan.display(),
        "spawning command"
    );

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args);
    if let Some(dir) = plan.working_dir.as_deref() {
        cmd.current_dir(dir);
    }
    for (key, value) in &plan.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    isolate_process_group(&mut cmd);
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", plan.program))?;

    let stdout = child.stdout.take().context("missing stdout")?;
    let stderr = child.stderr.take().context("missing stderr")?;
    let stdout_task = tokio::spawn(stream::forward_chunks(stdout, chunks.clone()));
    let stderr_task = tokio::spawn(stream::forward_chunks(stderr, chunks));

    let mut cancelled = false;
    let status = tokio::select! {
        status = child.wait() => Some(status.with_context(|| format!("wait on {}", plan.program))?),
        _ = cancel.cancelled() => {
            cancelled = true;
            terminate_process_group(&mut child, TERMINATE_GRACE).await
        }
    };

    for (name, task) in [("stdout", stdout_task), ("stderr", stderr_task)] {
        let abort = task.abort_handle();
        match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                tracing::warn!(command_id = %id, stream = name, error = %err, "read failed");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                abort.abort();
                tracing::debug!(command_id = %id, stream = name, "pipe still open after exit");
            }
        }
    }

    if cancelled {
        return Ok(ExitOutcome::Cancelled);
    }
    Ok(match status {
        Some(status) if status.success() || plan.nonzero_ok => ExitOutcome::Succeeded,
        Some(status) => ExitOutcome::Failed {
            detail: format!("{} exited with {}", plan.program, status),
        },
        None => ExitOutcome::Failed {
            detail: format!("{} exit status unavailable", plan.program),
        },
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use protocol::{CommandId, CommandKind, CommandSpec};

    fn command(kind: CommandKind, action: &str, target: Option<&str>) -> PendingCommand {
        PendingCommand {
            id: CommandId(1),
            spec: CommandSpec {
                kind,
                action: action.to_string(),
                target: target.map(str::to_string),
                payload: serde_json::Value::Null,
            },
        }
    }

    #[tokio::test]
    async fn rejected_command_never_spawns() {
        let (tx, _rx) = mpsc::channel(8);
        let err = SystemExecutor
            .execute(
                &command(CommandKind::ServiceUnit, "restart", Some("$(reboot)")),
                tx,
                CancellationToken::new(),
            )
            .await
            .expect_err("rejected");
        assert!(err.to_string().contains("invalid target"), "{err}");
    }

    #[tokio::test]
    async fn cancelled_run_never_succeeds() {
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();
        // docker may be missing; a spawn error is fine too.
        let outcome = SystemExecutor
            .execute(&command(CommandKind::Container, "logs", Some("missing")), tx, cancel)
            .await;
        assert!(!matches!(outcome, Ok(ExitOutcome::Succeeded)));
    }

    fn shell(script: &str) -> ActionPlan {
        ActionPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: None,
            env: Vec::new(),
            nonzero_ok: false,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> String {
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn both_pipes_arrive_each_in_its_own_order() {
        let (tx, rx) = mpsc::channel(64);
        let outcome = run_plan(
            CommandId(1),
            &shell("echo o1; echo e1 >&2; echo o2; echo e2 >&2"),
            tx,
            CancellationToken::new(),
        )
        .await
        .expect("run");
        assert_eq!(outcome, ExitOutcome::Succeeded);

        let output = drain(rx).await;
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 4, "{output:?}");
        let stdout: Vec<_> = lines.iter().filter(|line| line.starts_with('o')).collect();
        let stderr: Vec<_> = lines.iter().filter(|line| line.starts_with('e')).collect();
        assert_eq!(stdout, [&"o1", &"o2"]);
        assert_eq!(stderr, [&"e1", &"e2"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure() {
        let (tx, rx) = mpsc::channel(64);
        let outcome = run_plan(CommandId(1), &shell("echo broken >&2; exit 3"), tx, CancellationToken::new())
            .await
            .expect("run");
        assert!(matches!(outcome, ExitOutcome::Failed { ref detail } if detail.starts_with("sh exited with")));
        assert_eq!(drain(rx).await, "broken\n");
    }

    #[cfg(target_os = "linux")]
    fn process_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            // Zombies left for an absent reaper count as gone.
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => true,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_kills_the_whole_process_group() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                run_plan(CommandId(1), &shell("sleep 30 & echo \"pid $!\"; wait"), tx, cancel).await
            }
        });

        let mut seen = String::new();
        let pid: u32 = tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.ends_with('\n') {
                seen.push_str(&rx.recv().await.expect("pid line"));
            }
            seen.trim()
                .strip_prefix("pid ")
                .and_then(|pid| pid.parse().ok())
                .expect("pid")
        })
        .await
        .expect("background pid in time");

        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("stops after cancel")
            .expect("join")
            .expect("run");
        assert_eq!(outcome, ExitOutcome::Cancelled);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !process_gone(pid) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(process_gone(pid), "background child {pid} survived");
    }
}
