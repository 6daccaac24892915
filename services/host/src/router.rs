//! Axum Router Configuration

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{
    Router,
    routing::{delete, get},
};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/history", delete(handlers::delete_guest_history))
        .route("/history/{user_key}", delete(handlers::delete_history))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}
