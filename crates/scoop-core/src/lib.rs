//! Shared types and configuration for the Scoop conversation engine.
//!
//! Everything here is dependency-light: the message/part model that the
//! LLM provider, the function-calling loop, and the persistence layer all
//! agree on, plus the figment-based configuration and the public error
//! codes surfaced to clients.

pub mod config;
pub mod error;
pub mod types;

pub use config::ScoopConfig;
pub use error::{ErrorCode, LlmError};
pub use types::{ChatMessage, FinishReason, FunctionCall, ModelResponse, Part, Role, StreamChunk};
