//! Core domain types for the digit trading bot.
//!
//! This crate provides the types shared by every layer of the execution fabric:
//! - `ContractKind`, `ContractParams`: what a strategy asks the broker to price and buy
//! - `Signal`, `TradeIntent`: strategy-layer intents queued for the worker pool
//! - `Operation`: settled trade record handed to persistence

pub mod contract;
pub mod error;
pub mod money;
pub mod operation;
pub mod signal;

pub use contract::{ContractId, ContractKind, ContractParams, LimitOrder};
pub use error::{CoreError, Result};
pub use operation::{Operation, OperationResult};
pub use signal::{Signal, SignalId, TradeIntent};
