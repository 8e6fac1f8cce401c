use tracing_subscriber::EnvFilter;

/// The agent runs under a service manager that captures its output, so logs
/// go to stdout (or stderr) rather than files.
pub(crate) fn init_tracing(log_to_stderr: bool, json: bool) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false);
    match (json, log_to_stderr) {
        (true, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (true, false) => builder.json().try_init(),
        (false, true) => builder.with_writer(std::io::stderr).try_init(),
        (false, false) => builder.try_init(),
    }
    .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}"))
}
