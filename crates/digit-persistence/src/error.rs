//! Persistence error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Insert rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;
