use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use scoop_core::{ChatMessage, LlmError, ModelResponse, Part, StreamChunk};
use scoop_inference::ThinkingKnob;

/// Tool schema entry sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema-like argument shape.
    pub parameters: serde_json::Value,
}

/// Configuration for one chat session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Which thinking knob the target model accepts (from the router's
    /// model config); `None` disables thinking entirely.
    pub thinking: Option<ThinkingKnob>,
    /// The loop drives function calling manually; the provider must not
    /// execute tools on its own.
    pub disable_automatic_function_calling: bool,
}

/// Boxed stream of response chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// One multi-turn chat session against the provider.
///
/// The session owns its history: `send_message` appends the outgoing user
/// message and the received model message; the streaming variant appends
/// the accumulated model message when the stream completes.
#[async_trait]
pub trait ChatSession: Send {
    async fn send_message(&mut self, parts: Vec<Part>) -> Result<ModelResponse, LlmError>;

    async fn send_message_stream(&mut self, parts: Vec<Part>) -> Result<ChunkStream, LlmError>;

    /// Full history including turns exchanged in this session.
    fn history(&self) -> Vec<ChatMessage>;
}

/// The LLM provider boundary consumed by the engine.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Open a chat session seeded with prior history.
    fn start_chat(&self, config: SessionConfig, history: Vec<ChatMessage>) -> Box<dyn ChatSession>;

    /// One-shot generation without tools (compaction summaries, fact
    /// extraction).
    async fn generate(
        &self,
        model: &str,
        system_instruction: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<ModelResponse, LlmError>;

    /// Embed a text; returns a vector of length 768 or 3072.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}
