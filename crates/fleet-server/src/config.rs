use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::auth::Role;
use crate::hub::HubLimits;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut keys = std::collections::HashSet::new();
        for host in &self.hosts {
            if host.id.trim().is_empty() {
                anyhow::bail!("host id must not be empty");
            }
            if host.api_key.len() < 16 {
                anyhow::bail!("api_key for host {} is too short", host.id);
            }
            if !keys.insert(host.api_key.as_str()) {
                anyhow::bail!("api_key for host {} is reused", host.id);
            }
        }
        let mut tokens = std::collections::HashSet::new();
        for operator in &self.operators {
            if operator.token.len() < 16 {
                anyhow::bail!("token for operator {} is too short", operator.name);
            }
            if !tokens.insert(operator.token.as_str()) {
                anyhow::bail!("token for operator {} is reused", operator.name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_capacity: usize,
    pub viewer_capacity: usize,
    pub viewer_write_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: 100,
            viewer_capacity: 256,
            viewer_write_timeout_secs: 10,
        }
    }
}

impl StreamConfig {
    pub fn hub_limits(&self) -> HubLimits {
        HubLimits {
            chunk_capacity: self.chunk_capacity,
            viewer_capacity: self.viewer_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub stalled_after_minutes: u64,
    pub sweep_interval_secs: u64,
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stalled_after_minutes: 60,
            sweep_interval_secs: 300,
            history_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    pub token: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database() -> PathBuf {
    PathBuf::from("fleet.db")
}

fn default_role() -> Role {
    Role::Viewer
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
listen_addr = "0.0.0.0:9000"
database = ":memory:"

[stream]
chunk_capacity = 10
viewer_capacity = 20
viewer_write_timeout_secs = 3

[[hosts]]
id = "h1"
api_key = "h1-key-0123456789"

[[operators]]
name = "alice"
token = "alice-token-0123456789"
role = "admin"

[[operators]]
name = "bob"
token = "bob-token-0123456789"
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config: ServerConfig = toml::from_str(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.stream.chunk_capacity, 10);
        assert_eq!(config.queue.stalled_after_minutes, 60);
        assert_eq!(config.operators[0].role, Role::Admin);
        assert_eq!(config.operators[1].role, Role::Viewer);
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config: ServerConfig = toml::from_str(
            "[queue]\nstalled_after_minutes = 30\n\n[stream]\nchunk_capacity = 5\n",
        )
        .expect("parse");
        assert_eq!(config.queue.stalled_after_minutes, 30);
        assert_eq!(config.queue.sweep_interval_secs, 300);
        assert_eq!(config.queue.history_limit, 50);
        assert_eq!(config.stream.chunk_capacity, 5);
        assert_eq!(config.stream.viewer_capacity, 256);
        assert_eq!(config.stream.viewer_write_timeout_secs, 10);
    }

    #[test]
    fn rejects_shared_api_keys() {
        let config: ServerConfig = toml::from_str(
            r#"
[[hosts]]
id = "h1"
api_key = "same-key-0123456789"

[[hosts]]
id = "h2"
api_key = "same-key-0123456789"
"#,
        )
        .expect("parse");
        assert!(config.validate().is_err());
    }
}
