pub mod api;
pub mod ws;

use crate::auth::AccessGate;
use crate::config::Config;
use axum::{Router, routing::get};
use std::sync::Arc;
use whiteboard_sync::RoomRegistry;

pub use api::{ApiError, api_routes, room_routes};
pub use ws::ws_routes;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub gate: AccessGate,
    pub max_payload_bytes: usize,
}

impl AppState {
    pub fn new(registry: Arc<RoomRegistry>, config: &Config) -> Self {
        Self {
            registry,
            gate: AccessGate::new(config.access_token.clone()),
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

/// All routes, without the CORS and tracing layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Whiteboard Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", api_routes(state.clone()))
        .merge(room_routes(state.clone()))
        .merge(ws_routes(state))
}
