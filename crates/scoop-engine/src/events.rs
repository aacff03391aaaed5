use serde::Serialize;

use crate::buffer::QuickReply;

/// One server-sent event produced by the streaming pipeline.
///
/// For any successful request the emitted sequence satisfies
/// `thinking* text products? tip? quick_replies? done`; any error
/// terminates the stream with exactly one `error` event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    Thinking {
        content: String,
        step: u32,
        is_final: bool,
    },
    Text {
        content: String,
    },
    Products {
        /// Markdown-rendered product cards.
        content: String,
    },
    Tip {
        content: String,
    },
    QuickReplies {
        replies: Vec<QuickReply>,
    },
    Done {
        success: bool,
        session_id: String,
        elapsed_seconds: f64,
        thinking_steps: u32,
        model_used: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_used: Option<bool>,
    },
    Error {
        code: String,
        message: String,
        can_retry: bool,
    },
}

impl SseEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SseEvent::Thinking { .. } => "thinking",
            SseEvent::Text { .. } => "text",
            SseEvent::Products { .. } => "products",
            SseEvent::Tip { .. } => "tip",
            SseEvent::QuickReplies { .. } => "quick_replies",
            SseEvent::Done { .. } => "done",
            SseEvent::Error { .. } => "error",
        }
    }

    /// Wire form: `event: <type>\ndata: <json>\n\n`. The JSON payload
    /// repeats the type for clients that ignore SSE event names.
    pub fn to_sse_block(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.event_type(), data)
    }
}
