use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use scoop_core::config::LlmConfig;
use scoop_core::{ChatMessage, FinishReason, LlmError, ModelResponse, Part, Role, StreamChunk};
use scoop_inference::ThinkingKnob;

use crate::provider::{ChatSession, ChunkStream, LlmClient, SessionConfig};

/// Safety settings sent with every generation request: block only high
/// probability harms, matching the production deployment.
fn safety_settings() -> serde_json::Value {
    json!([
        { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_ONLY_HIGH" },
        { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_ONLY_HIGH" },
        { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_ONLY_HIGH" },
        { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_ONLY_HIGH" }
    ])
}

/// REST client for a Gemini-style `generateContent` API.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    embedding_model: String,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig, embedding_model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            embedding_model: embedding_model.into(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let response = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(LlmError::RateLimited { retry_after_ms: 1000 });
            }
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: truncate(&message, 300),
            });
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))
    }

    fn generation_config(
        temperature: f32,
        max_output_tokens: u32,
        thinking: Option<&ThinkingKnob>,
    ) -> serde_json::Value {
        let mut config = json!({
            "temperature": temperature,
            "maxOutputTokens": max_output_tokens,
        });
        match thinking {
            Some(ThinkingKnob::Level(level)) => {
                config["thinkingConfig"] = json!({
                    "thinkingLevel": level,
                    "includeThoughts": true,
                });
            }
            Some(ThinkingKnob::Budget(budget)) => {
                config["thinkingConfig"] = json!({
                    "thinkingBudget": budget,
                    "includeThoughts": true,
                });
            }
            None => {}
        }
        config
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn start_chat(&self, config: SessionConfig, history: Vec<ChatMessage>) -> Box<dyn ChatSession> {
        // The REST path never executes tools on its own; the flag pins
        // the contract for SDK-backed implementations.
        debug_assert!(config.disable_automatic_function_calling);
        Box::new(GeminiChatSession {
            client: self.clone(),
            config,
            history: Arc::new(Mutex::new(history)),
        })
    }

    async fn generate(
        &self,
        model: &str,
        system_instruction: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<ModelResponse, LlmError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": Self::generation_config(temperature, max_output_tokens, None),
            "safetySettings": safety_settings(),
        });
        let raw = self.post_json(&url, &body).await?;
        Ok(parse_response(&raw))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let url = format!(
            "{}/models/{}:embedContent",
            self.base_url, self.embedding_model
        );
        let body = json!({
            "content": { "parts": [{ "text": text }] }
        });
        let raw = self.post_json(&url, &body).await?;
        raw.pointer("/embedding/values")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| LlmError::Parse("embedding response missing values".to_string()))
    }
}

/// One chat session: owns its history, appends each exchanged turn.
struct GeminiChatSession {
    client: GeminiClient,
    config: SessionConfig,
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl GeminiChatSession {
    fn request_body(&self, history: &[ChatMessage]) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = history.iter().map(message_to_wire).collect();
        let mut body = json!({
            "systemInstruction": { "parts": [{ "text": self.config.system_instruction }] },
            "contents": contents,
            "generationConfig": GeminiClient::generation_config(
                self.config.temperature,
                self.config.max_output_tokens,
                self.config.thinking.as_ref(),
            ),
            "safetySettings": safety_settings(),
        });
        if !self.config.tools.is_empty() {
            let declarations: Vec<serde_json::Value> = self
                .config
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
        body
    }
}

#[async_trait]
impl ChatSession for GeminiChatSession {
    async fn send_message(&mut self, parts: Vec<Part>) -> Result<ModelResponse, LlmError> {
        let snapshot = {
            let mut history = self.history.lock().unwrap();
            history.push(ChatMessage::new(Role::User, parts));
            history.clone()
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.client.base_url, self.config.model
        );
        let raw = self.client.post_json(&url, &self.request_body(&snapshot)).await?;
        let response = parse_response(&raw);

        if !response.parts.is_empty() {
            let model_parts: Vec<Part> = response
                .parts
                .iter()
                .filter(|p| !matches!(p, Part::Thought { .. }))
                .cloned()
                .collect();
            if !model_parts.is_empty() {
                self.history
                    .lock()
                    .unwrap()
                    .push(ChatMessage::new(Role::Model, model_parts));
            }
        }
        Ok(response)
    }

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<ChunkStream, LlmError> {
        let snapshot = {
            let mut history = self.history.lock().unwrap();
            history.push(ChatMessage::new(Role::User, parts));
            history.clone()
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent",
            self.client.base_url, self.config.model
        );
        let response = self
            .client
            .http
            .post(&url)
            .query(&[("key", self.client.api_key.as_str()), ("alt", "sse")])
            .json(&self.request_body(&snapshot))
            .timeout(self.client.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.client.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: truncate(&message, 300),
            });
        }

        // The stream pushes the accumulated model turn into the shared
        // history when the provider stops sending chunks.
        let history = Arc::clone(&self.history);
        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            let mut byte_stream = response.bytes_stream();
            let mut line_buf = String::new();
            let mut model_parts: Vec<Part> = Vec::new();

            while let Some(bytes) = byte_stream.next().await {
                let bytes = match bytes {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(LlmError::Unavailable(e.to_string()));
                        break;
                    }
                };
                let Ok(text) = std::str::from_utf8(&bytes) else { continue };
                line_buf.push_str(text);

                // keep the incomplete last line in the buffer
                let mut lines: Vec<String> =
                    line_buf.split('\n').map(String::from).collect();
                line_buf = lines.pop().unwrap_or_default();

                for line in lines {
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    let Ok(raw) = serde_json::from_str::<serde_json::Value>(data) else {
                        continue;
                    };
                    let chunk_response = parse_response(&raw);
                    for p in &chunk_response.parts {
                        if !matches!(p, Part::Thought { .. }) {
                            model_parts.push(p.clone());
                        }
                    }
                    yield Ok(StreamChunk {
                        parts: chunk_response.parts,
                        finish_reason: chunk_response.finish_reason,
                    });
                }
            }

            if !model_parts.is_empty() {
                history.lock().unwrap().push(ChatMessage::new(Role::Model, model_parts));
            }
        };

        Ok(Box::pin(stream))
    }

    fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().unwrap().clone()
    }
}

/// Map a wire message to the REST `contents` entry.
fn message_to_wire(message: &ChatMessage) -> serde_json::Value {
    let parts: Vec<serde_json::Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::Text { text } => Some(json!({ "text": text })),
            // Thoughts are never sent back to the provider.
            Part::Thought { .. } => None,
            Part::FunctionCall { name, args } => {
                Some(json!({ "functionCall": { "name": name, "args": args } }))
            }
            Part::FunctionResponse { name, response } => {
                Some(json!({ "functionResponse": { "name": name, "response": response } }))
            }
        })
        .collect();
    json!({ "role": message.role.to_string(), "parts": parts })
}

/// Parse a `GenerateContentResponse` (full or streamed chunk).
fn parse_response(raw: &serde_json::Value) -> ModelResponse {
    let mut response = ModelResponse::default();

    if let Some(reason) = raw.pointer("/promptFeedback/blockReason").and_then(|v| v.as_str()) {
        response.block_reason = Some(reason.to_string());
    }

    let Some(candidate) = raw.pointer("/candidates/0") else {
        return response;
    };

    if let Some(reason) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        response.finish_reason = Some(FinishReason::parse(reason));
    }

    let Some(parts) = candidate.pointer("/content/parts").and_then(|v| v.as_array()) else {
        return response;
    };

    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call.get("name").and_then(|v| v.as_str()).unwrap_or("");
            let args = call.get("args").cloned().unwrap_or(json!({}));
            response.parts.push(Part::function_call(name, args));
        } else if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
            let is_thought = part.get("thought").and_then(|v| v.as_bool()).unwrap_or(false);
            if is_thought {
                response.parts.push(Part::thought(text));
            } else {
                response.parts.push(Part::text(text));
            }
        } else {
            debug!(?part, "unhandled response part");
        }
    }

    response
}

fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            secs: timeout.as_secs(),
        }
    } else if e.is_connect() {
        LlmError::Unavailable(e.to_string())
    } else {
        warn!(error = %e, "llm transport error");
        LlmError::Unavailable(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_and_thought_parts() {
        let raw = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "ვფიქრობ", "thought": true },
                    { "text": "გამარჯობა!" }
                ]},
                "finishReason": "STOP"
            }]
        });
        let response = parse_response(&raw);
        assert_eq!(response.parts.len(), 2);
        assert!(matches!(response.parts[0], Part::Thought { .. }));
        assert!(matches!(response.parts[1], Part::Text { .. }));
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[test]
    fn parse_function_call() {
        let raw = json!({
            "candidates": [{
                "content": { "parts": [
                    { "functionCall": { "name": "search_products", "args": { "query": "protein" } } }
                ]}
            }]
        });
        let response = parse_response(&raw);
        let calls = response.function_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search_products");
        assert_eq!(calls[0].args["query"], "protein");
    }

    #[test]
    fn parse_prompt_block() {
        let raw = json!({
            "promptFeedback": { "blockReason": "SAFETY" },
            "candidates": []
        });
        let response = parse_response(&raw);
        assert_eq!(response.block_reason.as_deref(), Some("SAFETY"));
        assert!(!response.has_meaningful_content());
    }

    #[test]
    fn wire_roles_and_function_parts() {
        let msg = ChatMessage::new(
            Role::User,
            vec![Part::function_response(
                "search_products",
                json!({ "count": 2 }),
            )],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["parts"][0]["functionResponse"]["name"], "search_products");
    }

    #[test]
    fn thoughts_are_not_sent_back() {
        let msg = ChatMessage::new(
            Role::Model,
            vec![Part::thought("internal"), Part::text("visible")],
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["parts"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn thinking_knob_emits_the_right_field() {
        let level = GeminiClient::generation_config(
            1.0,
            8192,
            Some(&ThinkingKnob::Level("HIGH".to_string())),
        );
        assert_eq!(level["thinkingConfig"]["thinkingLevel"], "HIGH");

        let budget =
            GeminiClient::generation_config(1.0, 8192, Some(&ThinkingKnob::Budget(16_384)));
        assert_eq!(budget["thinkingConfig"]["thinkingBudget"], 16_384);

        let none = GeminiClient::generation_config(1.0, 8192, None);
        assert!(none.get("thinkingConfig").is_none());
    }
}
