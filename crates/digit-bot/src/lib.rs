//! Digit trading bot.
//!
//! Wires the execution fabric into one [`Core`] value owned by `main`:
//! - Session pool and admission layer to the broker
//! - Order executor with open-contract quotas
//! - Signal queue drained by the worker pool through [`TradeHandler`]
//! - Health monitor with recovery callbacks and the status server
//! - Operation persistence (REST store with journal fallback)

pub mod app;
pub mod config;
pub mod error;
pub mod handler;
pub mod intake;
pub mod probe;

pub use app::Core;
pub use config::{AppConfig, Credentials};
pub use error::{AppError, AppResult};
pub use handler::TradeHandler;
pub use intake::{read_signals, IntakeStats};
pub use probe::CoreProbe;
