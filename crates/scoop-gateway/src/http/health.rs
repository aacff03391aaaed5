use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::app::AppState;

/// GET /health — component status snapshot.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": if state.hybrid.is_healthy() { "ok" } else { "degraded" },
        "circuit_state": state.hybrid.circuit_state().to_string(),
        "components": state.hybrid.status(),
    }))
}
