//! Pipeline error types.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Worker pool already started")]
    AlreadyStarted,

    #[error("Worker pool shut down")]
    ShutDown,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failure raised by a [`crate::SignalHandler`].
///
/// Retryable failures are requeued when the pool allows it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
