use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod stream;
pub mod validation;

pub use stream::{LiveStatus, StreamEvent};
pub use validation::{validate_command, validate_target_name, ValidationError};

/// Server-wide command identifier.
///
/// Persistence and JSON payloads carry the number; the streaming subscribe
/// path and hub keys use the decimal string. `Display` and `FromStr` are the
/// only conversions between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub i64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CommandId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.starts_with('+') {
            return Err(ValidationError::MalformedId(value.to_string()));
        }
        trimmed
            .parse::<i64>()
            .map(CommandId)
            .map_err(|_| ValidationError::MalformedId(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    #[serde(rename = "package", alias = "apt")]
    PackageManager,
    #[serde(rename = "container", alias = "docker")]
    Container,
    #[serde(rename = "service", alias = "systemd")]
    ServiceUnit,
    #[serde(rename = "logs", alias = "journal")]
    LogFetch,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::PackageManager => "package",
            CommandKind::Container => "container",
            CommandKind::ServiceUnit => "service",
            CommandKind::LogFetch => "logs",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "package" | "apt" => Ok(CommandKind::PackageManager),
            "container" | "docker" => Ok(CommandKind::Container),
            "service" | "systemd" => Ok(CommandKind::ServiceUnit),
            "logs" | "journal" => Ok(CommandKind::LogFetch),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

/// Persisted lifecycle status. "Running" is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

impl FromStr for CommandStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(CommandStatus::Pending),
            "completed" => Ok(CommandStatus::Completed),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

/// The only statuses an agent may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Completed,
    Failed,
}

impl From<FinalStatus> for CommandStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Completed => CommandStatus::Completed,
            FinalStatus::Failed => CommandStatus::Failed,
        }
    }
}

impl From<FinalStatus> for LiveStatus {
    fn from(status: FinalStatus) -> Self {
        match status {
            FinalStatus::Completed => LiveStatus::Completed,
            FinalStatus::Failed => LiveStatus::Failed,
        }
    }
}

/// Type, action, target and payload of a command, as issued by an operator
/// and as handed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: CommandId,
    #[serde(flatten)]
    pub spec: CommandSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub kernel: Option<String>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub agent_version: String,
    #[serde(default)]
    pub host: HostSnapshot,
    /// Commands the agent is currently executing or has queued.
    #[serde(default)]
    pub in_flight: Vec<CommandId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    #[serde(default)]
    pub commands: Vec<PendingCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRelay {
    pub command_id: CommandId,
    pub chunk: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedNotice {
    pub command_id: CommandId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageStatus {
    pub pending_packages: u32,
    pub security_updates: u32,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub status: FinalStatus,
    pub output: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_status: Option<PackageStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultAck {
    /// False when the command had already been resolved and this report was ignored.
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub host_id: String,
    #[serde(flatten)]
    pub spec: CommandSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub command_id: CommandId,
    pub status: CommandStatus,
}

/// Persisted command as returned by lookup and history endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub host_id: String,
    #[serde(flatten)]
    pub spec: CommandSpec,
    pub status: CommandStatus,
    pub output: String,
    pub timed_out: bool,
    pub issued_by: String,
    #[serde(default)]
    pub audit_log_id: Option<i64>,
    pub created_at_ms: i64,
    #[serde(default)]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
}

impl CommandRecord {
    /// Status a live viewer should see for this record.
    pub fn live_status(&self) -> LiveStatus {
        match self.status {
            CommandStatus::Pending if self.started_at_ms.is_some() => LiveStatus::Running,
            CommandStatus::Pending => LiveStatus::Pending,
            CommandStatus::Completed => LiveStatus::Completed,
            CommandStatus::Failed => LiveStatus::Failed,
        }
    }
}
