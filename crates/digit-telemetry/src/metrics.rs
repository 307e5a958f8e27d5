//! Prometheus metrics for the digit trading bot.
//!
//! Covers the whole execution fabric:
//! - Session pool health and reconnects
//! - Admission (RPC outcomes, latency, rate-limiter waits, breaker)
//! - Order lifecycle (trades, open contracts, proposal cache)
//! - Signal pipeline (queue depth, signal outcomes)
//! - Health monitor (status, recoveries)
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a fatal startup bug. These panics can only
//! happen during static initialization.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_gauge, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntGauge,
    TextEncoder,
};

/// Sessions currently authorized and passing health probes.
pub static WS_SESSIONS_HEALTHY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "digit_ws_sessions_healthy",
        "Number of authorized sessions whose last probe succeeded"
    )
    .unwrap()
});

/// Session reconnects and pool slot rebuilds.
pub static WS_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_ws_reconnect_total",
        "Total session reconnects",
        &["reason"]
    )
    .unwrap()
});

/// Ping round-trip latency.
pub static WS_PING_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "digit_ws_ping_latency_ms",
        "Application ping round-trip latency in milliseconds",
        &["session"],
        vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]
    )
    .unwrap()
});

/// RPC calls through the admission facade.
/// Labels: method, outcome (ok/api_error/timeout/transport/breaker_open/...)
pub static RPC_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_rpc_requests_total",
        "Total RPC calls by method and outcome",
        &["method", "outcome"]
    )
    .unwrap()
});

/// RPC latency from send to response.
pub static RPC_LATENCY_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "digit_rpc_latency_ms",
        "RPC round-trip latency in milliseconds",
        &["method"],
        vec![10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 15000.0]
    )
    .unwrap()
});

/// Time spent waiting for a rate window to open.
pub static RATE_LIMIT_WAIT_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "digit_rate_limit_wait_ms",
        "Time spent waiting in the client-side rate limiter",
        &["method"],
        vec![100.0, 500.0, 1000.0, 5000.0, 15000.0, 30000.0, 60000.0]
    )
    .unwrap()
});

/// Breaker state (0 = closed, 1 = half-open, 2 = open).
pub static BREAKER_STATE: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "digit_breaker_state",
        "Circuit breaker state (0=closed, 1=half_open, 2=open)"
    )
    .unwrap()
});

/// Breaker trips (closed/half-open -> open).
pub static BREAKER_TRIPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_breaker_trips_total",
        "Total circuit breaker trips",
        &["from"]
    )
    .unwrap()
});

/// Completed trades.
pub static TRADES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_trades_total",
        "Total settled trades",
        &["contract_type", "result"]
    )
    .unwrap()
});

/// Open contracts per kind.
pub static OPEN_CONTRACTS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "digit_open_contracts",
        "Open contracts per contract kind",
        &["contract_type"]
    )
    .unwrap()
});

/// Proposal cache lookups.
pub static PROPOSAL_CACHE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_proposal_cache_total",
        "Proposal cache lookups",
        &["result"]
    )
    .unwrap()
});

/// Signal queue depth.
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("digit_queue_depth", "Signals waiting in the queue").unwrap()
});

/// Signal outcomes.
/// Labels: outcome (accepted/displaced/rejected/success/failure/requeued/dropped)
pub static SIGNALS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_signals_total",
        "Signals by outcome",
        &["outcome"]
    )
    .unwrap()
});

/// Monitor status (0 = healthy, 1 = warning, 2 = degraded, 3 = failed).
pub static HEALTH_STATUS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "digit_health_status",
        "Health monitor status (0=healthy, 1=warning, 2=degraded, 3=failed)"
    )
    .unwrap()
});

/// Recovery callbacks fired by the monitor.
pub static RECOVERY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "digit_recovery_total",
        "Recovery actions fired by the health monitor",
        &["action"]
    )
    .unwrap()
});

/// Metrics helper.
pub struct Metrics;

impl Metrics {
    /// Set number of healthy sessions.
    pub fn sessions_healthy(count: usize) {
        WS_SESSIONS_HEALTHY.set(count as i64);
    }

    /// Record a session reconnect.
    pub fn ws_reconnect(reason: &str) {
        WS_RECONNECT_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Record ping latency for a session.
    pub fn ping_latency(session_id: u64, latency_ms: f64) {
        WS_PING_LATENCY_MS
            .with_label_values(&[&session_id.to_string()])
            .observe(latency_ms);
    }

    /// Record an RPC outcome.
    pub fn rpc_request(method: &str, outcome: &str) {
        RPC_REQUESTS_TOTAL
            .with_label_values(&[method, outcome])
            .inc();
    }

    /// Record RPC latency.
    pub fn rpc_latency(method: &str, latency_ms: f64) {
        RPC_LATENCY_MS
            .with_label_values(&[method])
            .observe(latency_ms);
    }

    /// Record a rate-limiter wait.
    pub fn rate_limit_wait(method: &str, wait_ms: f64) {
        RATE_LIMIT_WAIT_MS
            .with_label_values(&[method])
            .observe(wait_ms);
    }

    /// Set breaker state (0 = closed, 1 = half-open, 2 = open).
    pub fn breaker_state(value: f64) {
        BREAKER_STATE.set(value);
    }

    /// Record a breaker trip.
    pub fn breaker_tripped(from: &str) {
        BREAKER_TRIPS_TOTAL.with_label_values(&[from]).inc();
    }

    /// Record a settled trade.
    pub fn trade_settled(contract_type: &str, result: &str) {
        TRADES_TOTAL
            .with_label_values(&[contract_type, result])
            .inc();
    }

    /// Set open contracts for a kind.
    pub fn open_contracts(contract_type: &str, count: usize) {
        OPEN_CONTRACTS
            .with_label_values(&[contract_type])
            .set(count as f64);
    }

    /// Record a proposal cache hit or miss.
    pub fn proposal_cache(hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        PROPOSAL_CACHE_TOTAL.with_label_values(&[result]).inc();
    }

    /// Set queue depth.
    pub fn queue_depth(depth: usize) {
        QUEUE_DEPTH.set(depth as i64);
    }

    /// Record a signal outcome.
    pub fn signal(outcome: &str) {
        SIGNALS_TOTAL.with_label_values(&[outcome]).inc();
    }

    /// Set monitor status.
    pub fn health_status(value: f64) {
        HEALTH_STATUS.set(value);
    }

    /// Record a recovery action.
    pub fn recovery(action: &str) {
        RECOVERY_TOTAL.with_label_values(&[action]).inc();
    }

    /// Render every registered metric in the text exposition format.
    pub fn encode() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let families = prometheus::gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
