//! Monitor error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Failed to bind status server on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Status server failed: {0}")]
    Serve(#[source] std::io::Error),
}

pub type MonitorResult<T> = Result<T, MonitorError>;
