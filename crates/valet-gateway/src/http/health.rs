use std::sync::Arc;

use axum::{extract::State, Json};

use crate::app::AppState;

/// GET /health — liveness plus a coarse view of the tool catalog.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "valet",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
        "tools": state.coordinator.list_tools().len(),
    }))
}
