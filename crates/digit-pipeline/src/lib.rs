//! Signal intake for the digit trading bot.
//!
//! # Key Components
//!
//! - [`SignalQueue`]: bounded two-class queue, high priority first, newest
//!   high-priority signal displaces the oldest low-priority one when full
//! - [`WorkerPool`]: fixed set of workers feeding signals to a
//!   [`SignalHandler`] under an operation semaphore

pub mod error;
pub mod queue;
pub mod worker;

pub use error::{HandlerError, PipelineError, PipelineResult};
pub use queue::{HistoryEntry, PushOutcome, QueueConfig, QueueStats, RejectReason, SignalQueue};
pub use worker::{SignalHandler, WorkerPool, WorkerPoolConfig, WorkerStats};
