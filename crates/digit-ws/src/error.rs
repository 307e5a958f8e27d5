//! WebSocket error types.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Session not ready: {0}")]
    NotConnected(String),

    #[error("Authorization rejected: {code}: {message}")]
    Authorization { code: String, message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No healthy connection available")]
    NoHealthyConnection,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Message parse error: {0}")]
    ParseError(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Socket-level failures that a pool repair can fix.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            WsError::ConnectionFailed(_)
                | WsError::ConnectionLost(_)
                | WsError::ConnectionClosed { .. }
                | WsError::NotConnected(_)
                | WsError::Tungstenite(_)
        )
    }
}

pub type WsResult<T> = Result<T, WsError>;
