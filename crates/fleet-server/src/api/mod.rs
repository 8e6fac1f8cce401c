mod agent;
mod commands;
mod stream;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agent/heartbeat", post(agent::heartbeat))
        .route("/api/agent/command/started", post(agent::command_started))
        .route("/api/agent/command/stream", post(agent::relay_chunk))
        .route("/api/agent/command/result", post(agent::command_result))
        .route("/api/commands", post(commands::enqueue))
        .route("/api/commands/:id", get(commands::get_command))
        .route("/api/commands/:id/stream", get(stream::stream_ws))
        .route("/api/hosts/:host_id/commands", get(commands::host_history))
        .with_state(state)
        .layer(middleware::from_fn(log_http_request))
}

async fn health() -> &'static str {
    "ok"
}

async fn log_http_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = next.run(req).await;
    let status = response.status();
    // Chunk relays arrive many times per second during a command.
    if path == "/api/agent/command/stream" && status.is_success() {
        tracing::trace!(method = %method, path = %path, status = %status, "http request");
    } else {
        tracing::info!(method = %method, path = %path, status = %status, "http request");
    }
    response
}
