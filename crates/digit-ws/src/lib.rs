//! Broker WebSocket client for the digit trading bot.
//!
//! Provides the session layer of the execution fabric:
//! - Correlation ids and a waiter table routing responses by `req_id`
//! - Authenticated sessions with a single serialised write path
//! - Ping probing (25s) with reconnect on repeated failure or slow pongs
//! - A pool of sessions with round-robin selection and slot rebuilds

pub mod correlation;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod pool;
pub mod session;
pub mod transport;

pub use correlation::{CorrelationIdGenerator, WaiterGuard, WaiterTable};
pub use error::{WsError, WsResult};
pub use heartbeat::{HeartbeatManager, HeartbeatStats, ProbeVerdict};
pub use message::{
    requests, ApiError, ApiResponse, ApiResult, BuyReceipt, Method, OpenContractState,
    Portfolio, PortfolioContract, ProposalQuote, TickHistory,
};
pub use pool::{PoolConfig, PoolStats, SessionPool};
pub use session::{Session, SessionConfig, SessionState, SessionStats};
pub use transport::{BoxFuture, DynTransport, Transport};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any connection is opened.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
