//! Executor error types.

use digit_core::{ContractId, ContractKind, CoreError};
use digit_gate::CallError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("Open-contract quota exceeded for {kind}: {open}/{limit}")]
    QuotaExceeded {
        kind: ContractKind,
        open: usize,
        limit: usize,
    },

    #[error("Broker rejected request: {code}: {message}")]
    Api { code: String, message: String },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("Contract {0} not settled before deadline")]
    SettleTimeout(ContractId),

    #[error("Invalid contract parameters: {0}")]
    InvalidParams(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ExecutorError {
    /// Only call-level failures the admission layer marks retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutorError::Call(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Broker-side semantic rejection.
    #[must_use]
    pub fn is_api_error(&self) -> bool {
        matches!(self, ExecutorError::Api { .. })
    }
}

impl From<CoreError> for ExecutorError {
    fn from(e: CoreError) -> Self {
        ExecutorError::InvalidParams(e.to_string())
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
