//! The conversation engine: a bounded function-calling loop over an LLM
//! provider, response assembly, context compaction, and the top-level
//! orchestrator that turns one user message into a streamed reply of
//! text, product cards, an optional tip, and quick replies.

pub mod buffer;
pub mod compact;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod extract;
pub mod floop;
pub mod gemini;
pub mod preflight;
pub mod prompt;
pub mod provider;
pub mod thinking;

pub use buffer::{BufferSnapshot, ResponseBuffer};
pub use engine::{ConversationEngine, ConversationResult};
pub use error::EngineError;
pub use events::SseEvent;
pub use executor::{ToolBackend, ToolExecutor, ToolResult};
pub use floop::{FunctionLoop, LoopConfig, LoopOutput};
pub use gemini::GeminiClient;
pub use provider::{ChatSession, ChunkStream, LlmClient, SessionConfig, ToolDefinition};
pub use thinking::ThinkingStrategy;
