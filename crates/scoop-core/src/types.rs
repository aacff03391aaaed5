use serde::{Deserialize, Serialize};
use std::fmt;

/// Who authored a message. The provider API knows only these two roles;
/// tool results travel inside user-role messages as `FunctionResponse` parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Model => write!(f, "model"),
        }
    }
}

/// One content part of a message.
///
/// Invariants enforced by construction, not by validation:
/// `FunctionCall` parts appear only in model-role messages and
/// `FunctionResponse` parts only in user-role messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    /// Internal model reasoning. Never persisted into prompt history and
    /// never counted as meaningful content.
    Thought { text: String },
    FunctionCall { name: String, args: serde_json::Value },
    FunctionResponse { name: String, response: serde_json::Value },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text { text: s.into() }
    }

    pub fn thought(s: impl Into<String>) -> Self {
        Part::Thought { text: s.into() }
    }

    pub fn function_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        Part::FunctionCall {
            name: name.into(),
            args,
        }
    }

    pub fn function_response(name: impl Into<String>, response: serde_json::Value) -> Self {
        Part::FunctionResponse {
            name: name.into(),
            response,
        }
    }

    /// Visible text content, if this is a plain text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Part::FunctionCall { .. })
    }
}

/// A function call requested by the model, extracted from a response part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// A full (non-streaming) model response: the first candidate's parts plus
/// the signals the fallback trigger inspects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<Part>,
    pub finish_reason: Option<FinishReason>,
    /// Prompt-feedback block reason, when the prompt itself was rejected.
    pub block_reason: Option<String>,
}

impl ModelResponse {
    /// Non-thought text parts and function calls both count as content.
    pub fn has_meaningful_content(&self) -> bool {
        self.parts.iter().any(|p| match p {
            Part::Text { text } => !text.trim().is_empty(),
            Part::FunctionCall { .. } => true,
            _ => false,
        })
    }

    pub fn function_calls(&self) -> Vec<FunctionCall> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::FunctionCall { name, args } => Some(FunctionCall {
                    name: name.clone(),
                    args: args.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// One chunk of a streamed model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub parts: Vec<Part>,
    pub finish_reason: Option<FinishReason>,
}

/// A single message in conversation history. Always has at least one part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl ChatMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }

    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Concatenated visible text of this message (thoughts excluded).
    pub fn visible_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts.iter().any(Part::is_function_call)
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Recitation,
    Other,
    Unspecified,
}

impl FinishReason {
    /// Parse the provider's string form. Unknown values map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" => FinishReason::Safety,
            "RECITATION" => FinishReason::Recitation,
            "FINISH_REASON_UNSPECIFIED" | "UNSPECIFIED" => FinishReason::Unspecified,
            _ => FinishReason::Other,
        }
    }

    /// Terminal reasons that count as failures toward the circuit breaker.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            FinishReason::Safety
                | FinishReason::Recitation
                | FinishReason::Other
                | FinishReason::MaxTokens
        )
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::Stop => "STOP",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::Safety => "SAFETY",
            FinishReason::Recitation => "RECITATION",
            FinishReason::Other => "OTHER",
            FinishReason::Unspecified => "UNSPECIFIED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_text_skips_thoughts_and_calls() {
        let msg = ChatMessage::new(
            Role::Model,
            vec![
                Part::thought("planning"),
                Part::text("გამარჯობა"),
                Part::function_call("search_products", serde_json::json!({"query": "protein"})),
                Part::text("!"),
            ],
        );
        assert_eq!(msg.visible_text(), "გამარჯობა!");
        assert!(msg.has_function_calls());
    }

    #[test]
    fn finish_reason_parse_round_trip() {
        for s in ["STOP", "MAX_TOKENS", "SAFETY", "RECITATION", "OTHER"] {
            assert_eq!(FinishReason::parse(s).to_string(), s);
        }
        assert_eq!(FinishReason::parse("WEIRD_NEW_REASON"), FinishReason::Other);
    }

    #[test]
    fn terminal_failure_classification() {
        assert!(FinishReason::Safety.is_terminal_failure());
        assert!(FinishReason::MaxTokens.is_terminal_failure());
        assert!(!FinishReason::Stop.is_terminal_failure());
        assert!(!FinishReason::Unspecified.is_terminal_failure());
    }

    #[test]
    fn part_serde_shape() {
        let p = Part::function_call("search_products", serde_json::json!({"query": "bcaa"}));
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("function_call").is_some());
        let back: Part = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
