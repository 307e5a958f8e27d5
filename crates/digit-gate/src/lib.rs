//! Admission layer for broker calls.
//!
//! Every RPC the executor issues passes through [`Admission::call`]:
//! circuit breaker, global and per-class semaphores, per-method sliding rate
//! window, then the session pool.

pub mod admission;
pub mod breaker;
pub mod error;
pub mod rate_limiter;

pub use admission::{Admission, AdmissionConfig, AdmissionStats, RpcClient};
pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker, Decision, Outcome};
pub use error::{CallError, CallResult};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateWindow};
