use regex::Regex;
use std::path::{Component, Path};
use std::sync::OnceLock;
use thiserror::Error;

use crate::{CommandKind, CommandSpec};

const TARGET_PATTERN: &str = r"^[A-Za-z0-9._:@\-]{1,256}$";
pub const DEFAULT_LOG_LINES: u32 = 200;
pub const MAX_LOG_LINES: u32 = 5000;

const PACKAGE_ACTIONS: &[&str] = &["update", "upgrade", "dist-upgrade"];
const CONTAINER_ACTIONS: &[&str] = &[
    "start",
    "stop",
    "restart",
    "logs",
    "compose_up",
    "compose_down",
    "compose_restart",
    "compose_logs",
];
const SERVICE_ACTIONS: &[&str] = &["start", "stop", "restart", "enable", "disable", "status"];
const LOG_ACTIONS: &[&str] = &["logs"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown command type: {0}")]
    UnknownKind(String),
    #[error("unknown status: {0}")]
    UnknownStatus(String),
    #[error("unknown action {action} for {kind}")]
    UnknownAction { kind: CommandKind, action: String },
    #[error("{kind} commands require a target")]
    MissingTarget { kind: CommandKind },
    #[error("{kind} commands do not take a target")]
    UnexpectedTarget { kind: CommandKind },
    #[error("invalid target name: {0:?}")]
    InvalidTarget(String),
    #[error("invalid working directory: {0:?}")]
    InvalidWorkingDir(String),
    #[error("invalid line count: {0}")]
    InvalidLineCount(String),
    #[error("malformed command id: {0:?}")]
    MalformedId(String),
}

fn target_regex() -> Option<&'static Regex> {
    static TARGET: OnceLock<Option<Regex>> = OnceLock::new();
    TARGET.get_or_init(|| Regex::new(TARGET_PATTERN).ok()).as_ref()
}

/// Rejects any name that could smuggle shell or option syntax into a system
/// command. Names are never rewritten.
pub fn validate_target_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.starts_with('-')
        && target_regex().is_some_and(|regex| regex.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidTarget(name.to_string()))
    }
}

pub fn allowed_actions(kind: CommandKind) -> &'static [&'static str] {
    match kind {
        CommandKind::PackageManager => PACKAGE_ACTIONS,
        CommandKind::Container => CONTAINER_ACTIONS,
        CommandKind::ServiceUnit => SERVICE_ACTIONS,
        CommandKind::LogFetch => LOG_ACTIONS,
    }
}

fn requires_target(kind: CommandKind) -> bool {
    !matches!(kind, CommandKind::PackageManager)
}

pub fn validate_command(spec: &CommandSpec) -> Result<(), ValidationError> {
    if !allowed_actions(spec.kind).contains(&spec.action.as_str()) {
        return Err(ValidationError::UnknownAction {
            kind: spec.kind,
            action: spec.action.clone(),
        });
    }

    match (&spec.target, requires_target(spec.kind)) {
        (Some(target), true) => validate_target_name(target)?,
        (None, true) => return Err(ValidationError::MissingTarget { kind: spec.kind }),
        (Some(target), false) if !target.is_empty() => {
            return Err(ValidationError::UnexpectedTarget { kind: spec.kind })
        }
        _ => {}
    }

    match spec.kind {
        CommandKind::Container if spec.action.starts_with("compose_") => {
            working_dir(&spec.payload)?;
        }
        CommandKind::LogFetch => {
            log_lines(&spec.payload)?;
        }
        _ => {}
    }
    Ok(())
}

/// Optional absolute `working_dir` for compose actions.
pub fn working_dir(payload: &serde_json::Value) -> Result<Option<String>, ValidationError> {
    let Some(value) = payload.get("working_dir") else {
        return Ok(None);
    };
    let Some(dir) = value.as_str() else {
        return Err(ValidationError::InvalidWorkingDir(value.to_string()));
    };
    let path = Path::new(dir);
    let escapes = path
        .components()
        .any(|component| matches!(component, Component::ParentDir));
    if !path.is_absolute() || escapes || dir.len() > 4096 {
        return Err(ValidationError::InvalidWorkingDir(dir.to_string()));
    }
    Ok(Some(dir.to_string()))
}

/// Line count for log fetches, defaulting to [`DEFAULT_LOG_LINES`].
pub fn log_lines(payload: &serde_json::Value) -> Result<u32, ValidationError> {
    let Some(value) = payload.get("lines") else {
        return Ok(DEFAULT_LOG_LINES);
    };
    match value.as_u64() {
        Some(lines) if (1..=u64::from(MAX_LOG_LINES)).contains(&lines) => Ok(lines as u32),
        _ => Err(ValidationError::InvalidLineCount(value.to_string())),
    }
}
