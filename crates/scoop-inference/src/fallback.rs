use std::collections::BTreeMap;
use std::sync::Mutex;

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use scoop_core::{FinishReason, LlmError, ModelResponse};

/// Categorised fallback reasons for metrics and routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    None,
    SafetyBlock,
    RecitationBlock,
    ServiceUnavailable,
    InternalError,
    RateLimited,
    EmptyResponse,
    /// Text ends mid-sentence (dangling colon or conjunction).
    IncompleteResponse,
    Timeout,
    UnknownError,
    CircuitOpen,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::None => "none",
            FallbackReason::SafetyBlock => "safety_block",
            FallbackReason::RecitationBlock => "recitation_block",
            FallbackReason::ServiceUnavailable => "service_unavailable",
            FallbackReason::InternalError => "internal_error",
            FallbackReason::RateLimited => "rate_limited",
            FallbackReason::EmptyResponse => "empty_response",
            FallbackReason::IncompleteResponse => "incomplete_response",
            FallbackReason::Timeout => "timeout",
            FallbackReason::UnknownError => "unknown_error",
            FallbackReason::CircuitOpen => "circuit_open",
        }
    }
}

/// Result of fallback trigger analysis.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackDecision {
    pub should_fallback: bool,
    pub reason: FallbackReason,
    pub details: String,
    /// Can the same model be retried first?
    pub retryable: bool,
    /// 1 = low, 2 = medium, 3 = high.
    pub severity: u8,
}

impl FallbackDecision {
    fn ok(details: &str) -> Self {
        Self {
            should_fallback: false,
            reason: FallbackReason::None,
            details: details.to_string(),
            retryable: false,
            severity: 0,
        }
    }
}

/// Stateless classifier of provider responses and errors into fallback
/// decisions. Circuit breaker state is managed separately; the only state
/// here is the per-reason observability counters.
pub struct FallbackTrigger {
    safety_re: Regex,
    recitation_re: Regex,
    counters: Mutex<BTreeMap<FallbackReason, u64>>,
}

impl Default for FallbackTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackTrigger {
    pub fn new() -> Self {
        Self {
            safety_re: Regex::new(
                r"(?i)SAFETY|blocked.*safety|content.*policy|HARM_CATEGORY|safety.*block",
            )
            .expect("safety pattern"),
            recitation_re: Regex::new(
                r"(?i)RECITATION|grounding.*(policy|block)|source.*attribution",
            )
            .expect("recitation pattern"),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Classify a completed model response.
    ///
    /// Priority: terminal finish reasons, prompt-feedback blocks, then the
    /// empty-response check (no non-thought text and no function call).
    pub fn analyze_response(&self, response: &ModelResponse) -> FallbackDecision {
        match response.finish_reason {
            Some(FinishReason::Safety) => {
                return self.decide(
                    FallbackReason::SafetyBlock,
                    "finish reason SAFETY".to_string(),
                    false,
                    3,
                );
            }
            Some(FinishReason::Recitation) => {
                return self.decide(
                    FallbackReason::RecitationBlock,
                    "finish reason RECITATION".to_string(),
                    false,
                    2,
                );
            }
            _ => {}
        }

        if let Some(block) = &response.block_reason {
            if block != "BLOCK_REASON_UNSPECIFIED" && self.safety_re.is_match(block) {
                return self.decide(
                    FallbackReason::SafetyBlock,
                    format!("prompt blocked: {block}"),
                    false,
                    3,
                );
            }
        }

        if !response.has_meaningful_content() {
            return self.decide(
                FallbackReason::EmptyResponse,
                "response has no meaningful content".to_string(),
                true,
                1,
            );
        }

        FallbackDecision::ok("response OK")
    }

    /// Classify a provider error.
    pub fn analyze_error(&self, error: &LlmError) -> FallbackDecision {
        let message = error.to_string();

        match error {
            LlmError::RateLimited { .. } => {
                return self.decide(FallbackReason::RateLimited, message, true, 2);
            }
            LlmError::Timeout { .. } => {
                return self.decide(FallbackReason::Timeout, message, true, 2);
            }
            LlmError::Unavailable(_) => {
                return self.decide(FallbackReason::ServiceUnavailable, message, true, 2);
            }
            LlmError::Api { status, .. } => {
                // HTTP-style classification before pattern matching
                match status {
                    429 => return self.decide(FallbackReason::RateLimited, message, true, 2),
                    503 => {
                        return self.decide(FallbackReason::ServiceUnavailable, message, true, 2)
                    }
                    500..=599 => {
                        return self.decide(FallbackReason::InternalError, message, true, 2)
                    }
                    _ => {}
                }
            }
            _ => {}
        }

        if self.safety_re.is_match(&message) {
            return self.decide(FallbackReason::SafetyBlock, message, false, 3);
        }
        if self.recitation_re.is_match(&message) {
            return self.decide(FallbackReason::RecitationBlock, message, false, 2);
        }
        if message.to_lowercase().contains("timeout") {
            return self.decide(FallbackReason::Timeout, message, true, 2);
        }

        warn!(error = %message, "unknown error triggering fallback");
        self.decide(FallbackReason::UnknownError, message, true, 1)
    }

    /// Check whether assembled text looks cut off mid-sentence.
    ///
    /// Only texts of 50+ chars are considered; shorter replies may be
    /// intentionally terse. Dangling patterns: a trailing colon or a
    /// trailing Georgian conjunction.
    pub fn analyze_text_completeness(&self, text: &str) -> FallbackDecision {
        let stripped = text.trim();
        if stripped.chars().count() < 50 {
            return FallbackDecision::ok("text too short to check completeness");
        }

        let dangling = [
            (":", "ends with colon"),
            ("ვარიანტებია:", "ends with 'options are:'"),
            ("შემდეგია:", "ends with 'following:'"),
            (" და", "ends with 'and'"),
            (" მაგრამ", "ends with 'but'"),
        ];
        for (suffix, description) in dangling {
            if stripped.ends_with(suffix) {
                warn!(description, "incomplete response detected");
                return self.decide(
                    FallbackReason::IncompleteResponse,
                    format!("response {description}"),
                    true,
                    2,
                );
            }
        }

        FallbackDecision::ok("response appears complete")
    }

    /// Per-reason counts since construction.
    pub fn metrics(&self) -> BTreeMap<&'static str, u64> {
        self.counters
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect()
    }

    fn decide(
        &self,
        reason: FallbackReason,
        details: String,
        retryable: bool,
        severity: u8,
    ) -> FallbackDecision {
        *self.counters.lock().unwrap().entry(reason).or_insert(0) += 1;
        FallbackDecision {
            should_fallback: true,
            reason,
            details,
            retryable,
            severity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoop_core::Part;

    fn trigger() -> FallbackTrigger {
        FallbackTrigger::new()
    }

    #[test]
    fn safety_finish_reason_is_not_retryable() {
        let resp = ModelResponse {
            parts: vec![Part::text("partial")],
            finish_reason: Some(FinishReason::Safety),
            block_reason: None,
        };
        let d = trigger().analyze_response(&resp);
        assert!(d.should_fallback);
        assert_eq!(d.reason, FallbackReason::SafetyBlock);
        assert!(!d.retryable);
        assert_eq!(d.severity, 3);
    }

    #[test]
    fn recitation_finish_reason() {
        let resp = ModelResponse {
            parts: vec![],
            finish_reason: Some(FinishReason::Recitation),
            block_reason: None,
        };
        let d = trigger().analyze_response(&resp);
        assert_eq!(d.reason, FallbackReason::RecitationBlock);
        assert!(!d.retryable);
    }

    #[test]
    fn prompt_feedback_block() {
        let resp = ModelResponse {
            parts: vec![Part::text("ok")],
            finish_reason: Some(FinishReason::Stop),
            block_reason: Some("SAFETY".to_string()),
        };
        let d = trigger().analyze_response(&resp);
        assert_eq!(d.reason, FallbackReason::SafetyBlock);
    }

    #[test]
    fn thought_only_response_is_empty() {
        let resp = ModelResponse {
            parts: vec![Part::thought("just thinking")],
            finish_reason: Some(FinishReason::Stop),
            block_reason: None,
        };
        let d = trigger().analyze_response(&resp);
        assert_eq!(d.reason, FallbackReason::EmptyResponse);
        assert!(d.retryable);
    }

    #[test]
    fn function_call_counts_as_content() {
        let resp = ModelResponse {
            parts: vec![Part::function_call("search_products", serde_json::json!({}))],
            finish_reason: None,
            block_reason: None,
        };
        let d = trigger().analyze_response(&resp);
        assert!(!d.should_fallback);
    }

    #[test]
    fn http_status_classification() {
        let t = trigger();
        let cases = [
            (503u16, FallbackReason::ServiceUnavailable),
            (500, FallbackReason::InternalError),
            (429, FallbackReason::RateLimited),
        ];
        for (status, expected) in cases {
            let d = t.analyze_error(&LlmError::Api {
                status,
                message: "upstream".to_string(),
            });
            assert_eq!(d.reason, expected, "status {status}");
            assert!(d.retryable);
        }
    }

    #[test]
    fn safety_pattern_in_error_message() {
        let d = trigger().analyze_error(&LlmError::Api {
            status: 400,
            message: "request blocked by safety filters (HARM_CATEGORY)".to_string(),
        });
        assert_eq!(d.reason, FallbackReason::SafetyBlock);
        assert!(!d.retryable);
    }

    #[test]
    fn timeout_error() {
        let d = trigger().analyze_error(&LlmError::Timeout { secs: 30 });
        assert_eq!(d.reason, FallbackReason::Timeout);
        assert!(d.retryable);
    }

    #[test]
    fn unknown_error_falls_back_as_precaution() {
        let d = trigger().analyze_error(&LlmError::Parse("garbage".to_string()));
        assert_eq!(d.reason, FallbackReason::UnknownError);
        assert!(d.retryable);
        assert_eq!(d.severity, 1);
    }

    #[test]
    fn short_text_is_never_incomplete() {
        let d = trigger().analyze_text_completeness("მოკლე პასუხი:");
        assert!(!d.should_fallback);
    }

    #[test]
    fn long_text_ending_with_colon_is_incomplete() {
        let text = format!("{} საუკეთესო ვარიანტებია:", "დეტალური რჩევა პროტეინზე. ".repeat(5));
        let d = trigger().analyze_text_completeness(&text);
        assert_eq!(d.reason, FallbackReason::IncompleteResponse);
        assert!(d.retryable);
    }

    #[test]
    fn dangling_conjunction_is_incomplete() {
        let text = format!("{} ეს ყველაფერი კარგია და", "x".repeat(60));
        let d = trigger().analyze_text_completeness(&text);
        assert_eq!(d.reason, FallbackReason::IncompleteResponse);
    }

    #[test]
    fn complete_text_passes() {
        let text = format!("{} ეს არის სრული რეკომენდაცია.", "y".repeat(60));
        let d = trigger().analyze_text_completeness(&text);
        assert!(!d.should_fallback);
    }

    #[test]
    fn counters_accumulate_per_reason() {
        let t = trigger();
        t.analyze_error(&LlmError::Timeout { secs: 1 });
        t.analyze_error(&LlmError::Timeout { secs: 1 });
        let m = t.metrics();
        assert_eq!(m.get("timeout"), Some(&2));
    }
}
