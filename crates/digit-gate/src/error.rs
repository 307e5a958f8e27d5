//! Admission error types.

use std::time::Duration;
use thiserror::Error;

/// Failure of one admitted call.
///
/// Broker `error` payloads are not failures at this layer; they come back
/// inside the response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("Circuit breaker open (half_open={half_open})")]
    BreakerOpen { half_open: bool },

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No healthy connection available")]
    NoHealthyConnection,

    #[error("Broker rate limit: {0}")]
    BrokerRateLimited(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Admission closed")]
    Closed,
}

impl CallError {
    /// Whether a retry policy may try again.
    ///
    /// A fully open breaker is terminal for the current operation; a
    /// half-open denial only means the probe slots are taken.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::BreakerOpen { half_open } => *half_open,
            CallError::Timeout(_)
            | CallError::Transport(_)
            | CallError::NoHealthyConnection
            | CallError::BrokerRateLimited(_) => true,
            CallError::Cancelled | CallError::Closed => false,
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            CallError::BreakerOpen { .. } => "breaker_open",
            CallError::Timeout(_) => "timeout",
            CallError::Transport(_) => "transport",
            CallError::NoHealthyConnection => "no_healthy_connection",
            CallError::BrokerRateLimited(_) => "rate_limited",
            CallError::Cancelled => "cancelled",
            CallError::Closed => "closed",
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;
