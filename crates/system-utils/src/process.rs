use std::io;
use std::process::{ExitStatus, Output, Stdio};

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

/// Time a process group gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Runs the child in its own session so the whole tree (apt -> dpkg, docker
/// compose -> plugins) can be signalled at once.
#[cfg(unix)]
pub fn isolate_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

/// SIGTERM to the group, then SIGKILL once `grace` expires.
pub async fn terminate_process_group(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, libc::SIGTERM);
    if let Ok(status) = timeout(grace, child.wait()).await {
        return status.ok();
    }
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    let _ = child.kill().await;
    match timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}

/// Runs a short helper command to completion, killing it on timeout.
pub async fn run_command_with_timeout(
    cmd: &mut Command,
    command_timeout: Duration,
    label: &str,
) -> anyhow::Result<Output> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().with_context(|| format!("spawn {label}"))?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_all(stdout_pipe));
    let stderr_task = tokio::spawn(read_all(stderr_pipe));

    let status = match timeout(command_timeout, child.wait()).await {
        Ok(result) => result.with_context(|| format!("{label} failed"))?,
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            anyhow::bail!("{label} timed out after {}s", command_timeout.as_secs())
        }
    };
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buffer).await;
    }
    buffer
}
