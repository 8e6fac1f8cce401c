use serde::{Deserialize, Serialize};

use crate::CommandId;

/// Status as seen by live viewers. `Running` exists only here; it is never
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NotFound,
}

impl LiveStatus {
    /// After a terminal status nothing more is sent for the command.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LiveStatus::Completed | LiveStatus::Failed | LiveStatus::NotFound
        )
    }
}

/// Event delivered to a viewer watching one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        command_id: String,
        chunk: String,
    },
    Status {
        command_id: String,
        status: LiveStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

impl StreamEvent {
    pub fn chunk(id: CommandId, chunk: impl Into<String>) -> Self {
        StreamEvent::Chunk {
            command_id: id.to_string(),
            chunk: chunk.into(),
        }
    }

    pub fn status(id: CommandId, status: LiveStatus, output: Option<String>) -> Self {
        StreamEvent::Status {
            command_id: id.to_string(),
            status,
            output,
        }
    }

    pub fn command_id(&self) -> &str {
        match self {
            StreamEvent::Chunk { command_id, .. } | StreamEvent::Status { command_id, .. } => {
                command_id
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Status { status, .. } if status.is_terminal())
    }
}
