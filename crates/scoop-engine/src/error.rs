use thiserror::Error;

use scoop_core::{ErrorCode, LlmError};

/// Engine-level failures. The terminal variants map 1:1 onto the public
/// error codes; everything else is normalised before reaching clients.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The loop produced no text even after its summary retry.
    #[error("model returned no usable response")]
    EmptyResponse,

    /// A round exceeded its wall-clock deadline; terminal for the request.
    #[error("round timed out after {secs}s")]
    LoopTimeout { secs: u64 },

    /// Content blocked by the provider with no fallback left.
    #[error("content blocked: {reason}")]
    ContentBlocked { reason: String },

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("persistence error: {0}")]
    Memory(#[from] scoop_memory::MemoryError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map to the public wire-level error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::EmptyResponse => ErrorCode::EmptyResponse,
            EngineError::LoopTimeout { .. } => ErrorCode::Timeout,
            EngineError::ContentBlocked { .. } => ErrorCode::ContentBlocked,
            EngineError::Llm(LlmError::Timeout { .. }) => ErrorCode::Timeout,
            EngineError::Llm(_) => ErrorCode::InternalError,
            EngineError::Memory(_) => ErrorCode::InternalError,
            EngineError::Internal(_) => ErrorCode::InternalError,
        }
    }
}
