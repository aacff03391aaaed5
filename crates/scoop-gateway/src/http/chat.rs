//! Chat endpoints — POST /chat (sync JSON) and POST /chat/stream (SSE).
//!
//! Request: `{"user_id": "...", "message": "...", "session_id"?: "..."}`
//!
//! Sync response:
//! `{"response_text_geo", "products", "tip", "quick_replies", "success",
//!   "error"?, "metadata": {...}}`
//!
//! The stream emits `thinking* text products? tip? quick_replies? done`,
//! or a single `error` event.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use scoop_engine::SseEvent;

use crate::app::AppState;

#[derive(Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

fn validate(req: &ChatRequest) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    if req.user_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "user_id is required" })),
        ));
    }
    if req.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "message cannot be empty" })),
        ));
    }
    Ok(())
}

/// POST /chat — synchronous mode.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    validate(&req)?;

    match state
        .engine
        .process_message(&req.user_id, &req.message, req.session_id.as_deref())
        .await
    {
        Ok(result) => Ok(Json(json!({
            "response_text_geo": result.text,
            "products": result.products,
            "tip": result.tip,
            "quick_replies": result.quick_replies,
            "success": true,
            "metadata": {
                "session_id": result.session_id,
                "model_used": result.model_used,
                "rounds": result.rounds,
                "products_count": result.products.len(),
                "elapsed_seconds": result.elapsed_seconds,
                "fallback_used": result.fallback_used,
            },
        }))),
        Err(e) => {
            let code = e.code();
            warn!(error = %e, code = code.as_str(), "sync chat failed");
            Ok(Json(json!({
                "response_text_geo": code.user_message(),
                "products": [],
                "tip": null,
                "quick_replies": [],
                "success": false,
                "error": {
                    "code": code.as_str(),
                    "message": code.user_message(),
                    "can_retry": code.can_retry(),
                },
                "metadata": {},
            })))
        }
    }
}

/// POST /chat/stream — SSE mode.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<serde_json::Value>)>
{
    validate(&req)?;

    let events = state
        .engine
        .clone()
        .stream_message(req.user_id, req.message, req.session_id)
        .map(|event: SseEvent| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(Event::default().event(event.event_type()).data(data))
        });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
