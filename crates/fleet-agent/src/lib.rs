pub mod actions;
pub mod client;
pub mod config;
pub mod executor;
pub mod heartbeat;
pub mod runner;
pub mod snapshot;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
