use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use scoop_core::config::ScoopConfig;
use scoop_engine::ConversationEngine;
use scoop_inference::HybridManager;

/// Shared state for all HTTP handlers.
pub struct AppState {
    pub engine: Arc<ConversationEngine>,
    pub hybrid: Arc<HybridManager>,
    pub config: ScoopConfig,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/chat", post(crate::http::chat::chat_handler))
        .route("/chat/stream", post(crate::http::chat::chat_stream_handler))
        .route("/health", get(crate::http::health::health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// "*" is permissive (development); otherwise a comma-separated origin
/// list. Unparseable origins are dropped with a warning.
fn cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .filter_map(|o| {
            let o = o.trim();
            match o.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = o, "invalid CORS origin, skipping");
                    None
                }
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
