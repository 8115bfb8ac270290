//! HTTP surface: health route plus the per-workspace sync endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::server::room::{self, RoomRegistry};

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub rooms: usize,
}

/// Build the server router over a room registry.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces/:id/sync", get(sync_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn health(State(registry): State<Arc<RoomRegistry>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        rooms: registry.room_count(),
    })
}

async fn sync_upgrade(
    Path(workspace_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(registry): State<Arc<RoomRegistry>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").map(String::as_str);
    if !registry.authorize(&workspace_id, token) {
        tracing::debug!("rejected connection workspace={workspace_id}");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let room = registry.room(&workspace_id);
    // Echo the peer's token subprotocol, if it offered one, so strict
    // clients accept the upgrade.
    let ws = match token {
        Some(token) => ws.protocols([token.to_string()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| room::handle_socket(registry, room, socket))
}
