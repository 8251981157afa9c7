//! HTTP API: room resolution and observability endpoints
//!
//! Clients resolve a room here before opening their WebSocket; everything
//! realtime happens on `/ws`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateRoomBody {
    pub name: String,
}

/// `POST /api/rooms`: find-or-create a room by name.
/// Responds with the room row plus `isExisting`.
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRoomBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "room name must not be empty" })),
        ));
    }

    match state.store.find_or_create_room(name).await {
        Ok((room, is_existing)) => {
            if !is_existing {
                info!(room_id = room.id, room_name = %room.name, "room created");
            }
            Ok(Json(json!({
                "id": room.id,
                "name": room.name,
                "createdAt": room.created_at,
                "isExisting": is_existing,
            })))
        }
        Err(e) => {
            warn!("room find-or-create failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "failed to create room" })),
            ))
        }
    }
}

/// `GET /api/rooms/:id`: room lookup
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.store.find_room_by_id(id).await {
        Ok(Some(room)) => Ok(Json(json!({
            "id": room.id,
            "name": room.name,
            "createdAt": room.created_at,
        }))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "room not found" })),
        )),
        Err(e) => {
            warn!("room lookup failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "room lookup failed" })),
            ))
        }
    }
}

/// Health check endpoint
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "stagelink-gw",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Status endpoint with live fan-out counters
pub async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "stagelink-gw",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "activeRooms": state.registry.room_count(),
        "activeConnections": state.registry.connection_count(),
    }))
}
