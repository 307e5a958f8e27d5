//! Per-method sliding-window rate limiter.
//!
//! Each method keeps the instants of its recent calls. When the window is
//! full, `acquire` sleeps until the oldest entry leaves the window plus a
//! small random jitter. The limiter never rejects; callers only see latency.

use digit_telemetry::Metrics;
use digit_ws::Method;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;
use tokio::time::Instant;
use tracing::debug;

/// Allowed calls per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub max_calls: u32,
    pub window_secs: u64,
}

impl RateWindow {
    pub const fn new(max_calls: u32, window_secs: u64) -> Self {
        Self {
            max_calls,
            window_secs,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Windows keyed by method name.
    pub windows: HashMap<String, RateWindow>,
    /// Window for methods without an entry.
    pub default_window: RateWindow,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let windows = [
            ("buy", RateWindow::new(3, 60)),
            ("proposal", RateWindow::new(5, 60)),
            ("ticks_history", RateWindow::new(10, 60)),
            ("proposal_open_contract", RateWindow::new(20, 60)),
        ]
        .into_iter()
        .map(|(name, window)| (name.to_string(), window))
        .collect();

        Self {
            windows,
            default_window: RateWindow::new(5, 60),
            jitter_min_ms: 100,
            jitter_max_ms: 500,
        }
    }
}

type Timestamps = Arc<TokioMutex<VecDeque<Instant>>>;

/// Sliding-window limiter with one lock per method.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, Timestamps>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Window applied to `method`.
    pub fn window_for(&self, method: &Method) -> RateWindow {
        self.config
            .windows
            .get(method.as_str())
            .copied()
            .unwrap_or(self.config.default_window)
    }

    fn timestamps(&self, method: &Method) -> Timestamps {
        self.windows
            .lock()
            .entry(method.as_str().to_string())
            .or_default()
            .clone()
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.config.jitter_min_ms, self.config.jitter_max_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Wait until a call to `method` fits its window, then record it.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self, method: &Method) -> Duration {
        let rate = self.window_for(method);
        let window = rate.window();
        let max_calls = rate.max_calls.max(1) as usize;
        let timestamps = self.timestamps(method);
        let started = Instant::now();

        let mut calls = timestamps.lock().await;
        loop {
            let now = Instant::now();
            cleanup_old_timestamps(&mut calls, now, window);
            if calls.len() < max_calls {
                calls.push_back(now);
                break;
            }

            let Some(oldest) = calls.front().copied() else {
                continue;
            };
            let wait = (oldest + window).saturating_duration_since(now) + self.jitter();
            debug!(
                method = %method,
                calls = calls.len(),
                max_calls,
                wait_ms = wait.as_millis() as u64,
                "Rate window full, waiting"
            );
            tokio::time::sleep(wait).await;
        }
        drop(calls);

        let waited = started.elapsed();
        if !waited.is_zero() {
            Metrics::rate_limit_wait(method.as_str(), waited.as_secs_f64() * 1000.0);
        }
        waited
    }

    /// Calls recorded for `method` within its current window.
    pub async fn recent_calls(&self, method: &Method) -> usize {
        let window = self.window_for(method).window();
        let timestamps = self.timestamps(method);
        let mut calls = timestamps.lock().await;
        cleanup_old_timestamps(&mut calls, Instant::now(), window);
        calls.len()
    }

    /// Forget every recorded call.
    pub async fn reset(&self) {
        let all: Vec<Timestamps> = self.windows.lock().values().cloned().collect();
        for timestamps in all {
            timestamps.lock().await.clear();
        }
    }
}

/// Drop entries at or before `now - window`.
fn cleanup_old_timestamps(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = calls.front() {
        if now.saturating_duration_since(front) >= window {
            calls.pop_front();
        } else {
            break;
        }
    }
}
