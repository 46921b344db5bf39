// src/error.rs
// Standardized error types for mnemo

use thiserror::Error;

/// Main error type for the mnemo library
#[derive(Error, Debug)]
pub enum MnemoError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source error: {0}")]
    Source(String),

    #[error("authentication required: {0}")]
    AuthRequired(String),

    #[error("rate limited, retry after {wait_seconds}s")]
    RateLimited { wait_seconds: u64 },

    #[error("preprocessing error: {0}")]
    Preprocess(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("keyword index busy: {0}")]
    Busy(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("task cancelled")]
    Cancelled,

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using MnemoError
pub type Result<T> = std::result::Result<T, MnemoError>;

impl From<String> for MnemoError {
    fn from(s: String) -> Self {
        MnemoError::Other(s)
    }
}

impl From<tokio::task::JoinError> for MnemoError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MnemoError::Cancelled
        } else {
            MnemoError::Other(err.to_string())
        }
    }
}

impl From<MnemoError> for String {
    fn from(err: MnemoError) -> Self {
        err.to_string()
    }
}
