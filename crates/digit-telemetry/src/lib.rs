//! Prometheus metrics and structured logging for the digit trading bot.
//!
//! - Structured logging with tracing (JSON in production)
//! - Prometheus metrics for sessions, admission, orders, queue and health

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
