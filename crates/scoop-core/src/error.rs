use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the LLM provider boundary.
///
/// The HTTP client maps transport failures into these variants so that
/// the fallback trigger can classify them without seeing reqwest types.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Public error codes surfaced to clients, each with a Georgian
/// user-visible message and a retry hint.
///
/// These are the only failure shapes that escape the engine; everything
/// else is normalised internally or logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    EmptyResponse,
    Timeout,
    NoProducts,
    InternalError,
    ContentBlocked,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EmptyResponse => "empty_response",
            ErrorCode::Timeout => "timeout",
            ErrorCode::NoProducts => "no_products",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ContentBlocked => "content_blocked",
        }
    }

    /// Message shown to the end user, in Georgian.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::EmptyResponse => {
                "ბოდიში, პასუხი ვერ მოვამზადე. სცადეთ კითხვის გადაფორმულირება."
            }
            ErrorCode::Timeout => {
                "პასუხის მომზადებას ჩვეულებრივზე მეტი დრო დასჭირდა. სცადეთ თავიდან."
            }
            ErrorCode::NoProducts => {
                "სამწუხაროდ, შესაბამისი პროდუქტი ვერ მოიძებნა. სცადეთ სხვა მოთხოვნა."
            }
            ErrorCode::InternalError => {
                "დროებითი ტექნიკური ხარვეზია. სცადეთ რამდენიმე წამში."
            }
            ErrorCode::ContentBlocked => {
                "ამ კითხვაზე პასუხი ვერ გაიცემა. სცადეთ სხვაგვარად დასმა."
            }
        }
    }

    pub fn can_retry(&self) -> bool {
        match self {
            ErrorCode::EmptyResponse => true,
            ErrorCode::Timeout => true,
            ErrorCode::NoProducts => true,
            ErrorCode::InternalError => true,
            ErrorCode::ContentBlocked => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_messages_and_retry_flags() {
        for code in [
            ErrorCode::EmptyResponse,
            ErrorCode::Timeout,
            ErrorCode::NoProducts,
            ErrorCode::InternalError,
            ErrorCode::ContentBlocked,
        ] {
            assert!(!code.user_message().is_empty());
            assert!(!code.as_str().is_empty());
        }
        assert!(!ErrorCode::ContentBlocked.can_retry());
        assert!(ErrorCode::Timeout.can_retry());
    }

    #[test]
    fn serde_uses_snake_case() {
        let v = serde_json::to_value(ErrorCode::ContentBlocked).unwrap();
        assert_eq!(v, serde_json::json!("content_blocked"));
    }
}
