//! Circuit breaker guarding broker calls.
//!
//! closed -> open after `failure_threshold` consecutive failures;
//! open -> half_open once `recovery_timeout` has elapsed (on the next admit);
//! half_open -> closed on the first success, -> open on any failure.
//! While half-open at most `half_open_max_calls` admissions are outstanding.
//!
//! All transitions happen under one mutex.

use digit_telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Tripped; every admission is denied.
    Open,
    /// Probing with a limited number of admissions.
    HalfOpen,
}

impl BreakerState {
    /// Gauge value (0 = closed, 1 = half-open, 2 = open).
    pub fn gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Result of `admit()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed. `generation` identifies the breaker epoch the call belongs to.
    Allow { generation: u64 },
    /// Do not touch the network.
    Deny { half_open: bool },
}

impl Decision {
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Reported call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 120_000,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// Bumped on every transition; reports from an older epoch are ignored.
    generation: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    total_trips: u64,
    total_denied: u64,
}

/// Three-state circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Metrics::breaker_state(BreakerState::Closed.gauge());
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                generation: 0,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                half_open_in_flight: 0,
                total_trips: 0,
                total_denied: 0,
            }),
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery_timeout_ms)
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn admit(&self) -> Decision {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Decision {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Decision::Allow {
                generation: inner.generation,
            },
            BreakerState::Open => {
                let recovered = inner
                    .opened_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.recovery_timeout());
                if recovered {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Decision::Allow {
                        generation: inner.generation,
                    }
                } else {
                    inner.total_denied += 1;
                    Decision::Deny { half_open: false }
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls.max(1) {
                    inner.half_open_in_flight += 1;
                    Decision::Allow {
                        generation: inner.generation,
                    }
                } else {
                    inner.total_denied += 1;
                    Decision::Deny { half_open: true }
                }
            }
        }
    }

    /// Re-check a call admitted under `generation` right before it is sent.
    ///
    /// Open denies. Half-open denies calls that do not hold one of its slots.
    /// Closed allows and hands back the current generation.
    pub fn recheck(&self, generation: u64) -> Decision {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Decision::Allow {
                generation: inner.generation,
            },
            BreakerState::HalfOpen if inner.generation == generation => {
                Decision::Allow { generation }
            }
            BreakerState::HalfOpen => {
                inner.total_denied += 1;
                Decision::Deny { half_open: true }
            }
            BreakerState::Open => {
                inner.total_denied += 1;
                Decision::Deny { half_open: false }
            }
        }
    }

    /// Report the outcome of a call admitted in the current epoch.
    pub fn report(&self, outcome: Outcome) {
        let generation = self.inner.lock().generation;
        self.report_for(generation, outcome, Instant::now());
    }

    /// Report the outcome of a call admitted under `generation`.
    pub fn report_for(&self, generation: u64, outcome: Outcome, now: Instant) {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return;
        }
        match (inner.state, outcome) {
            (BreakerState::Closed, Outcome::Success) => {
                inner.consecutive_failures = 0;
            }
            (BreakerState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(now);
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    self.trip(&mut inner, now);
                }
            }
            (BreakerState::HalfOpen, Outcome::Success) => {
                inner.consecutive_failures = 0;
                inner.half_open_in_flight = 0;
                self.transition(&mut inner, BreakerState::Closed);
            }
            (BreakerState::HalfOpen, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                inner.last_failure = Some(now);
                self.trip(&mut inner, now);
            }
            (BreakerState::Open, Outcome::Failure) => {
                inner.last_failure = Some(now);
            }
            (BreakerState::Open, Outcome::Success) => {}
        }
    }

    /// Return a half-open slot for a call that was admitted but never
    /// reported (cancelled or abandoned).
    pub fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Administrative reset to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        self.transition(&mut inner, BreakerState::Closed);
        info!("Circuit breaker reset");
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        let from = inner.state;
        inner.opened_at = Some(now);
        inner.half_open_in_flight = 0;
        inner.total_trips += 1;
        self.transition(inner, BreakerState::Open);
        Metrics::breaker_tripped(&from.to_string());
        warn!(
            from = %from,
            consecutive_failures = inner.consecutive_failures,
            recovery_timeout_ms = self.config.recovery_timeout_ms,
            "Circuit breaker opened"
        );
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        Metrics::breaker_state(to.gauge());
        if from != to {
            info!(from = %from, to = %to, "Circuit breaker transition");
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let now = Instant::now();
        let open_remaining_ms = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(at)) => Some(
                self.recovery_timeout()
                    .saturating_sub(now.saturating_duration_since(at))
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            half_open_in_flight: inner.half_open_in_flight,
            total_trips: inner.total_trips,
            total_denied: inner.total_denied,
            last_failure_age_ms: inner
                .last_failure
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            open_remaining_ms,
        }
    }
}

/// Breaker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub half_open_in_flight: u32,
    pub total_trips: u64,
    pub total_denied: u64,
    pub last_failure_age_ms: Option<u64>,
    pub open_remaining_ms: Option<u64>,
}
