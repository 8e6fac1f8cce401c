use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use protocol::{
    ChunkRelay, CommandResult, HeartbeatReport, HeartbeatResponse, LiveStatus, ResultAck,
    StartedNotice,
};

use crate::auth::AgentIdentity;
use crate::completion::CompletionOutcome;
use crate::error::ApiError;
use crate::hub::PublishOutcome;
use crate::state::AppState;
use crate::store::StartOutcome;

pub(super) async fn heartbeat(
    agent: AgentIdentity,
    State(state): State<AppState>,
    Json(report): Json<HeartbeatReport>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let host_id = agent.host_id.as_str();
    if let Err(err) = state
        .store
        .touch_host(host_id, &report.agent_version, report.host)
        .await
    {
        tracing::warn!(event = "heartbeat.touch_failed", host_id, error = %err, "failed to record heartbeat");
    }
    if let Err(err) = state
        .completion
        .expire_stalled(Some(host_id), state.settings.stalled_after)
        .await
    {
        tracing::warn!(event = "heartbeat.expire_failed", host_id, error = %err, "stalled cleanup failed");
    }

    let commands = state.store.pending_for(host_id).await?;
    if !commands.is_empty() {
        let ids: Vec<String> = commands.iter().map(|command| command.id.to_string()).collect();
        tracing::info!(
            event = "command.dispatched",
            host_id,
            count = commands.len(),
            ids = %ids.join(","),
            in_flight = report.in_flight.len(),
            "pending commands handed to agent"
        );
    }
    Ok(Json(HeartbeatResponse {
        status: "ok".to_string(),
        commands,
    }))
}

pub(super) async fn command_started(
    agent: AgentIdentity,
    State(state): State<AppState>,
    Json(notice): Json<StartedNotice>,
) -> Result<StatusCode, ApiError> {
    let id = notice.command_id;
    match state.store.mark_started(id, &agent.host_id).await? {
        StartOutcome::Started => {
            tracing::info!(event = "command.started", command_id = %id, host_id = %agent.host_id, "command started");
            state.hub.publish_status(id, LiveStatus::Running, None);
            Ok(StatusCode::NO_CONTENT)
        }
        StartOutcome::AlreadyStarted | StartOutcome::AlreadyResolved => Ok(StatusCode::NO_CONTENT),
        StartOutcome::WrongHost => Err(not_owner(&agent, id)),
        StartOutcome::NotFound => Err(ApiError::NotFound(format!("command {id} not found"))),
    }
}

pub(super) async fn relay_chunk(
    agent: AgentIdentity,
    State(state): State<AppState>,
    Json(relay): Json<ChunkRelay>,
) -> Result<StatusCode, ApiError> {
    let id = relay.command_id;
    match state.store.owner_of(id).await? {
        Some(owner) if owner == agent.host_id => {}
        Some(_) => return Err(not_owner(&agent, id)),
        None => return Err(ApiError::NotFound(format!("command {id} not found"))),
    }
    if state.hub.publish(id, relay.chunk) == PublishOutcome::Dropped {
        tracing::debug!(event = "chunk.dropped", command_id = %id, "viewers behind, chunk dropped");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn command_result(
    agent: AgentIdentity,
    State(state): State<AppState>,
    Json(result): Json<CommandResult>,
) -> Result<Json<ResultAck>, ApiError> {
    let id = result.command_id;
    match state.completion.complete(&agent.host_id, result).await? {
        CompletionOutcome::Applied => Ok(Json(ResultAck { applied: true })),
        CompletionOutcome::Duplicate => Ok(Json(ResultAck { applied: false })),
        CompletionOutcome::WrongHost => Err(not_owner(&agent, id)),
        CompletionOutcome::NotFound => Err(ApiError::NotFound(format!("command {id} not found"))),
    }
}

fn not_owner(agent: &AgentIdentity, id: protocol::CommandId) -> ApiError {
    tracing::warn!(
        event = "command.foreign_host",
        command_id = %id,
        host_id = %agent.host_id,
        "agent reported on a command it does not own"
    );
    ApiError::Forbidden(format!("command {id} belongs to another host"))
}
