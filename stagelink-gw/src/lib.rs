//! StageLink Gateway library
//!
//! Exposes `build_router` and `AppState` so integration tests can drive the
//! gateway in-process with `tower::ServiceExt::oneshot` or a real listener.

pub mod api;
pub mod gateway;
pub mod registry;

use axum::{routing::get, routing::post, Router};
use stagelink_common::config::GatewayConfig;
use stagelink_common::db::Store;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use registry::{ConnectionRegistry, RoomLocks};

/// Application state shared by the WebSocket handler and the HTTP API
pub struct AppState {
    pub store: Store,
    pub registry: ConnectionRegistry,
    pub room_locks: RoomLocks,
    pub config: GatewayConfig,
}

impl AppState {
    pub fn new(store: Store, config: GatewayConfig) -> Self {
        Self {
            store,
            registry: ConnectionRegistry::new(),
            room_locks: RoomLocks::new(),
            config,
        }
    }
}

/// Build the gateway router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/api/rooms", post(api::create_room))
        .route("/api/rooms/:id", get(api::get_room))
        .route("/health", get(api::health))
        .route("/status", get(api::status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
