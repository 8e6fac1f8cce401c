use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent", version, about = "Fleet host agent")]
pub(crate) struct Args {
    /// Optional when FLEET_API_KEY is set.
    #[arg(long, default_value = "/etc/fleet/agent.toml")]
    pub(crate) config: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Emit JSON lines instead of human-readable logs.
    #[arg(long, default_value_t = false)]
    pub(crate) json_logs: bool,
}
