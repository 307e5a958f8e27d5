//! Ping-based health tracking for a session.
//!
//! The session's prober sends an application `ping` every interval and feeds
//! the outcome here. Two consecutive failures, or one pong slower than the
//! latency threshold, ask the session to reconnect.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

/// What the session should do after a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Probe succeeded in time.
    Healthy,
    /// Probe failed but the failure budget is not exhausted.
    Degraded,
    /// Reconnect now.
    Reconnect,
}

/// Heartbeat manager for session health.
#[derive(Debug)]
pub struct HeartbeatManager {
    /// Pong slower than this forces a reconnect.
    latency_threshold: Duration,
    /// Consecutive failed probes that force a reconnect.
    max_failures: u32,
    last_ping: RwLock<Option<DateTime<Utc>>>,
    last_pong: RwLock<Option<DateTime<Utc>>>,
    last_message: RwLock<DateTime<Utc>>,
    last_latency: RwLock<Option<Duration>>,
    consecutive_failures: AtomicU32,
    last_probe_ok: AtomicBool,
}

impl HeartbeatManager {
    pub fn new(latency_threshold: Duration, max_failures: u32) -> Self {
        Self {
            latency_threshold,
            max_failures: max_failures.max(1),
            last_ping: RwLock::new(None),
            last_pong: RwLock::new(None),
            last_message: RwLock::new(Utc::now()),
            last_latency: RwLock::new(None),
            consecutive_failures: AtomicU32::new(0),
            last_probe_ok: AtomicBool::new(true),
        }
    }

    /// Reset on a fresh, authorized connection. Authorization counts as a
    /// successful round trip.
    pub fn reset(&self) {
        let now = Utc::now();
        *self.last_ping.write() = None;
        *self.last_pong.write() = Some(now);
        *self.last_message.write() = now;
        *self.last_latency.write() = None;
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_probe_ok.store(true, Ordering::Release);
    }

    /// Record that a ping was sent.
    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Utc::now());
    }

    /// Record a pong and judge its latency.
    pub fn record_pong(&self, latency: Duration) -> ProbeVerdict {
        *self.last_pong.write() = Some(Utc::now());
        *self.last_latency.write() = Some(latency);
        self.consecutive_failures.store(0, Ordering::Release);

        if latency > self.latency_threshold {
            self.last_probe_ok.store(false, Ordering::Release);
            debug!(latency_ms = latency.as_millis() as u64, "Slow pong");
            ProbeVerdict::Reconnect
        } else {
            self.last_probe_ok.store(true, Ordering::Release);
            ProbeVerdict::Healthy
        }
    }

    /// Record a failed probe (timeout or error).
    pub fn record_failure(&self) -> ProbeVerdict {
        self.last_probe_ok.store(false, Ordering::Release);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.max_failures {
            ProbeVerdict::Reconnect
        } else {
            ProbeVerdict::Degraded
        }
    }

    /// Record that any frame was received.
    pub fn record_message(&self) {
        *self.last_message.write() = Utc::now();
    }

    #[must_use]
    pub fn last_probe_ok(&self) -> bool {
        self.last_probe_ok.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        *self.last_pong.read()
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            last_ping: *self.last_ping.read(),
            last_pong: *self.last_pong.read(),
            last_message: *self.last_message.read(),
            last_latency_ms: self.last_latency.read().map(|d| d.as_millis() as u64),
            consecutive_failures: self.consecutive_failures(),
            last_probe_ok: self.last_probe_ok(),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStats {
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub last_message: DateTime<Utc>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_probe_ok: bool,
}
