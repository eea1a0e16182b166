use std::sync::Arc;

use axum::{routing::get, Router};

use valet_agent::Orchestrator;
use valet_core::config::ValetConfig;
use valet_tools::ToolCoordinator;

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: ValetConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub coordinator: Arc<ToolCoordinator>,
    /// Base prompt with `{filesystem_access_info}` already resolved; the
    /// `{persona_definition}` placeholder is filled per identified user.
    pub base_template: String,
}

/// Assemble the session-tier router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
