use axum::extract::{Path, Query, State};
use axum::Json;
use protocol::{
    validate_command, CommandId, CommandRecord, CommandStatus, EnqueueRequest, EnqueueResponse,
};
use serde::Deserialize;

use crate::auth::Operator;
use crate::error::ApiError;
use crate::state::AppState;
use crate::store::{NewAuditEntry, NewCommand};

const MAX_HISTORY: usize = 500;

pub(super) async fn enqueue(
    operator: Operator,
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<EnqueueResponse>, ApiError> {
    operator.require_dispatch()?;
    validate_command(&request.spec)?;
    if !state.credentials.knows_host(&request.host_id) {
        return Err(ApiError::NotFound(format!("unknown host {}", request.host_id)));
    }

    let EnqueueRequest { host_id, spec } = request;
    let audit = NewAuditEntry {
        username: operator.name.clone(),
        action: format!("{}_{}", spec.kind, spec.action),
        host_id: host_id.clone(),
        details: spec.target.clone().unwrap_or_default(),
    };
    let kind = spec.kind;
    let action = spec.action.clone();
    let command_id = state
        .store
        .enqueue(
            NewCommand {
                host_id: host_id.clone(),
                spec,
                issued_by: operator.name.clone(),
            },
            Some(audit),
        )
        .await?;
    tracing::info!(
        event = "command.enqueued",
        command_id = %command_id,
        host_id = %host_id,
        kind = %kind,
        action = %action,
        issued_by = %operator.name,
        "command queued"
    );
    Ok(Json(EnqueueResponse {
        command_id,
        status: CommandStatus::Pending,
    }))
}

pub(super) async fn get_command(
    _operator: Operator,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<CommandRecord>, ApiError> {
    let id: CommandId = id.parse()?;
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("command {id} not found")))
}

#[derive(Debug, Deserialize)]
pub(super) struct HistoryQuery {
    limit: Option<usize>,
}

pub(super) async fn host_history(
    _operator: Operator,
    Path(host_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<AppState>,
) -> Result<Json<Vec<CommandRecord>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.settings.history_limit)
        .clamp(1, MAX_HISTORY);
    Ok(Json(state.store.recent_for_host(&host_id, limit).await?))
}
