use anyhow::Context;
use protocol::CommandKind;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_SERVER_URL: &str = "FLEET_SERVER_URL";
pub const ENV_API_KEY: &str = "FLEET_API_KEY";
pub const ENV_REPORT_INTERVAL: &str = "FLEET_REPORT_INTERVAL";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl AgentConfig {
    /// Reads the file if it exists, applies environment overrides, then
    /// validates. A missing file is fine when the environment supplies the key.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?
        } else {
            String::new()
        };
        let mut config = Self::parse(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|value| !value.is_empty()) {
            self.server_url = url;
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|value| !value.is_empty()) {
            self.api_key = key;
        }
        if let Some(interval) = lookup(ENV_REPORT_INTERVAL).filter(|value| !value.is_empty()) {
            let parsed = match interval.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => humantime::parse_duration(&interval)
                    .with_context(|| format!("invalid {ENV_REPORT_INTERVAL}: {interval}"))?,
            };
            self.report_interval_secs = parsed.as_secs();
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("api_key is required (config file or {ENV_API_KEY})");
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            anyhow::bail!("server_url must be an http(s) URL: {}", self.server_url);
        }
        if self.report_interval_secs == 0 {
            anyhow::bail!("report_interval_secs must be positive");
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub package_secs: u64,
    pub container_secs: u64,
    pub service_secs: u64,
    pub logs_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            package_secs: 600,
            container_secs: 120,
            service_secs: 30,
            logs_secs: 30,
        }
    }
}

impl TimeoutsConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            package: Duration::from_secs(self.package_secs.max(1)),
            container: Duration::from_secs(self.container_secs.max(1)),
            service: Duration::from_secs(self.service_secs.max(1)),
            logs: Duration::from_secs(self.logs_secs.max(1)),
        }
    }
}

/// Execution budget per command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub package: Duration,
    pub container: Duration,
    pub service: Duration,
    pub logs: Duration,
}

impl Timeouts {
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::PackageManager => self.package,
            CommandKind::Container => self.container,
            CommandKind::ServiceUnit => self.service,
            CommandKind::LogFetch => self.logs,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutsConfig::default().timeouts()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_output_bytes: u64,
    pub batch_queue_capacity: usize,
    pub relay_timeout_secs: u64,
    pub result_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            batch_queue_capacity: 10,
            relay_timeout_secs: 5,
            result_timeout_secs: 30,
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_report_interval_secs() -> u64 {
    30
}
