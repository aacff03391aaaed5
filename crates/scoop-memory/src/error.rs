use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// Fact text under 10 chars or embedding of an unsupported dimension.
    #[error("invalid fact: {0}")]
    InvalidFact(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
