//! Order lifecycle for the digit trading bot.
//!
//! # Key Components
//!
//! - [`OrderExecutor`]: proposal -> buy -> poll until settled, with retries
//! - [`RetryPolicy`]: capped exponential backoff over retryable call errors
//! - [`ProposalCache`]: 5s memo of proposal quotes keyed by contract fingerprint
//! - [`OpenContracts`]: per-kind open-position quota with reservations

pub mod cache;
pub mod error;
pub mod executor;
pub mod quota;
pub mod retry;

pub use cache::{CacheStats, ProposalCache};
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{
    BuyOutcome, ExecutionReport, ExecutorConfig, ExecutorStats, OrderExecutor, SettledOutcome,
};
pub use quota::{OpenContracts, Reconciled, Reservation};
pub use retry::RetryPolicy;
