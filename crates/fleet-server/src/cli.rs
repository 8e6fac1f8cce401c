use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleet-server", version, about = "Fleet command dispatch and streaming server")]
pub(crate) struct Args {
    #[arg(long, default_value = "config/server.toml")]
    pub(crate) config: PathBuf,
    /// Overrides `listen_addr` from the config file.
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    #[arg(long, default_value = "logs")]
    pub(crate) log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
