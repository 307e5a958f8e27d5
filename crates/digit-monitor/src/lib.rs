//! digit-monitor - health supervision for the digit trading bot.
//!
//! The monitor samples the pipeline and connection layers on a fixed
//! interval, classifies the result and fires the recovery callback
//! registered for that class:
//!
//! | Status | Recovery |
//! |---|---|
//! | `deadlock` | reset workers |
//! | `connection_issues` | reset breaker, or rebuild pool |
//! | `high_failure_rate` | clear queue |
//! | `inactivity` | rebuild pool |
//! | `high_memory` | none (warning) |
//!
//! A non-healthy state that outlives `deadlock_threshold`, or keeps failing
//! after `max_recovery_attempts`, escalates to `restart`.
//!
//! The status server exposes `GET /status` (JSON) and `GET /metrics`
//! (Prometheus text format).

pub mod error;
pub mod health;
pub mod memory;
pub mod server;

pub use error::{MonitorError, MonitorResult};
pub use health::{
    CheckReport, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthSample, HealthStatus,
    MonitorSnapshot, RecoveryAction, RecoveryCallback,
};
pub use memory::resident_memory_bytes;
pub use server::{create_router, run_server, StatusServerConfig, StatusSource};
