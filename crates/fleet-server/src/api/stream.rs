use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use protocol::{CommandId, CommandRecord, LiveStatus, StreamEvent};
use std::time::Duration;

use crate::auth::Operator;
use crate::error::ApiError;
use crate::state::AppState;

pub(super) async fn stream_ws(
    operator: Operator,
    Path(id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let id: CommandId = id.parse()?;
    Ok(ws.on_upgrade(move |socket| handle_viewer(socket, state, id, operator)))
}

/// Registers with the hub before reading the store, so a result landing in
/// between is seen either in the snapshot or as a live event.
async fn handle_viewer(mut socket: WebSocket, state: AppState, id: CommandId, operator: Operator) {
    let mut viewer = state.hub.register(id);
    let write_timeout = state.settings.viewer_write_timeout;
    tracing::info!(
        event = "stream.viewer_connected",
        command_id = %id,
        viewer = %viewer.id(),
        operator = %operator.name,
        "viewer connected"
    );

    let initial = match state.store.get(id).await {
        Ok(record) => initial_event(id, record.as_ref()),
        Err(err) => {
            tracing::warn!(event = "stream.lookup_failed", command_id = %id, error = %err, "store lookup failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let finished = initial.is_terminal();
    if send_event(&mut socket, &initial, write_timeout).await.is_err() || finished {
        close(socket, write_timeout).await;
        return;
    }

    loop {
        tokio::select! {
            event = viewer.recv() => {
                let Some(event) = event else {
                    // Hub dropped us for falling behind.
                    break;
                };
                if send_event(&mut socket, &event, write_timeout).await.is_err() {
                    break;
                }
                if event.is_terminal() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    tracing::info!(
        event = "stream.viewer_disconnected",
        command_id = %id,
        viewer = %viewer.id(),
        "viewer disconnected"
    );
    drop(viewer);
    close(socket, write_timeout).await;
}

fn initial_event(id: CommandId, record: Option<&CommandRecord>) -> StreamEvent {
    match record {
        None => StreamEvent::status(id, LiveStatus::NotFound, None),
        Some(record) => {
            let status = record.live_status();
            let output = status.is_terminal().then(|| record.output.clone());
            StreamEvent::status(id, status, output)
        }
    }
}

async fn send_event(
    socket: &mut WebSocket,
    event: &StreamEvent,
    write_timeout: Duration,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize stream event");
            return Ok(());
        }
    };
    match tokio::time::timeout(write_timeout, socket.send(Message::Text(payload))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(()),
        Err(_) => {
            tracing::warn!(event = "stream.write_timeout", command_id = event.command_id(), "viewer write timed out");
            Err(())
        }
    }
}

async fn close(mut socket: WebSocket, write_timeout: Duration) {
    let _ = tokio::time::timeout(write_timeout, socket.send(Message::Close(None))).await;
}
