use axum::Json;
use axum::extract::State;
use tfmux_protocol::TerminalSettings;

use crate::server::AppState;

/// GET /api/v1/settings
pub async fn get_settings(State(state): State<AppState>) -> Json<TerminalSettings> {
    Json(state.registry.settings().as_ref().clone())
}
