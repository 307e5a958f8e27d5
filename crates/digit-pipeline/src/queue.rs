//! Bounded priority queue for strategy signals.
//!
//! Two FIFO classes share one capacity:
//!
//! - **High** (`pattern_detected`): always popped first
//! - **Low**: popped only when no high-priority signal is waiting
//!
//! When the queue is full, a high-priority push evicts the oldest
//! low-priority signal; a low-priority push is rejected. The queue is the
//! single backpressure point of the pipeline.

use chrono::{DateTime, Utc};
use digit_core::{Signal, SignalId};
use digit_telemetry::Metrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// Config / results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub pop_timeout_ms: u64,
    /// Length of the processed-signal history ring.
    pub history_size: usize,
    /// Requeues allowed per signal.
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            pop_timeout_ms: 1_000,
            history_size: 100,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Full and nothing lower-priority to evict.
    Full,
    Closed,
    RetriesExhausted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "queue full"),
            Self::Closed => write!(f, "queue closed"),
            Self::RetriesExhausted => write!(f, "retries exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Accepted,
    /// Accepted by evicting this low-priority signal.
    Displaced(Signal),
    /// Not queued. Callers skip the signal.
    Rejected(RejectReason),
}

impl PushOutcome {
    #[must_use]
    pub fn is_queued(&self) -> bool {
        !matches!(self, PushOutcome::Rejected(_))
    }
}

/// One processed signal.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub signal_id: SignalId,
    pub high_priority: bool,
    pub success: bool,
    pub retry_count: u32,
    /// Creation to completion.
    pub latency_ms: i64,
    pub finished_at: DateTime<Utc>,
    /// The signal went back to the queue after this attempt.
    pub retrying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub high: usize,
    pub low: usize,
    pub capacity: usize,
    pub closed: bool,
    pub total_pushed: u64,
    pub total_displaced: u64,
    pub total_rejected: u64,
    pub total_requeued: u64,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub last_push: Option<DateTime<Utc>>,
}

// ============================================================================
// SignalQueue
// ============================================================================

#[derive(Default)]
struct QueueInner {
    high: VecDeque<Signal>,
    low: VecDeque<Signal>,
    history: VecDeque<HistoryEntry>,
    closed: bool,
    total_pushed: u64,
    total_displaced: u64,
    total_rejected: u64,
    total_requeued: u64,
    total_succeeded: u64,
    total_failed: u64,
    last_push: Option<DateTime<Utc>>,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

pub struct SignalQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    available: Notify,
}

impl SignalQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
            available: Notify::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn push(&self, signal: Signal) -> PushOutcome {
        self.insert(signal, false)
    }

    /// Queue `signal` again at the tail of its class with `retry_count + 1`.
    pub fn requeue(&self, signal: Signal) -> PushOutcome {
        if signal.retry_count >= self.config.max_retries {
            warn!(
                signal_id = %signal.signal_id,
                retry_count = signal.retry_count,
                "Signal dropped after max retries"
            );
            self.inner.lock().total_rejected += 1;
            Metrics::signal("retries_exhausted");
            return PushOutcome::Rejected(RejectReason::RetriesExhausted);
        }
        self.insert(signal.retried(), true)
    }

    fn insert(&self, signal: Signal, requeue: bool) -> PushOutcome {
        let mut inner = self.inner.lock();
        if inner.closed {
            inner.total_rejected += 1;
            drop(inner);
            Metrics::signal("rejected");
            return PushOutcome::Rejected(RejectReason::Closed);
        }

        let high = signal.is_high_priority();
        let outcome = if inner.depth() < self.config.capacity {
            PushOutcome::Accepted
        } else if high {
            match inner.low.pop_front() {
                Some(evicted) => PushOutcome::Displaced(evicted),
                None => PushOutcome::Rejected(RejectReason::Full),
            }
        } else {
            PushOutcome::Rejected(RejectReason::Full)
        };

        match &outcome {
            PushOutcome::Rejected(reason) => {
                inner.total_rejected += 1;
                debug!(signal_id = %signal.signal_id, high, %reason, "Signal rejected");
            }
            accepted => {
                if let PushOutcome::Displaced(evicted) = accepted {
                    inner.total_displaced += 1;
                    info!(
                        signal_id = %signal.signal_id,
                        evicted = %evicted.signal_id,
                        "High-priority signal displaced oldest low-priority signal"
                    );
                }
                if requeue {
                    inner.total_requeued += 1;
                } else {
                    inner.total_pushed += 1;
                    inner.last_push = Some(Utc::now());
                }
                if high {
                    inner.high.push_back(signal);
                } else {
                    inner.low.push_back(signal);
                }
            }
        }
        let depth = inner.depth();
        drop(inner);

        Metrics::queue_depth(depth);
        Metrics::signal(match &outcome {
            PushOutcome::Accepted if requeue => "requeued",
            PushOutcome::Accepted => "accepted",
            PushOutcome::Displaced(_) => "displaced",
            PushOutcome::Rejected(_) => "rejected",
        });
        if outcome.is_queued() {
            self.available.notify_one();
        }
        outcome
    }

    /// Head of the queue without waiting.
    pub fn try_pop(&self) -> Option<Signal> {
        let mut inner = self.inner.lock();
        let signal = inner.high.pop_front().or_else(|| inner.low.pop_front());
        let depth = inner.depth();
        drop(inner);
        if signal.is_some() {
            Metrics::queue_depth(depth);
        }
        signal
    }

    /// Head of the queue, waiting up to the configured pop timeout.
    pub async fn pop(&self) -> Option<Signal> {
        self.pop_within(Duration::from_millis(self.config.pop_timeout_ms))
            .await
    }

    pub async fn pop_within(&self, wait: Duration) -> Option<Signal> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(signal) = self.try_pop() {
                return Some(signal);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Record the result of processing `signal`.
    pub fn record_outcome(&self, signal: &Signal, success: bool, error: Option<String>) {
        self.record(signal, success, false, error);
    }

    /// Record a failed attempt whose signal was requeued.
    pub fn record_retry(&self, signal: &Signal, error: String) {
        self.record(signal, false, true, Some(error));
    }

    fn record(&self, signal: &Signal, success: bool, retrying: bool, error: Option<String>) {
        let now = Utc::now();
        let entry = HistoryEntry {
            signal_id: signal.signal_id.clone(),
            high_priority: signal.is_high_priority(),
            success,
            retry_count: signal.retry_count,
            latency_ms: signal.age_ms(now),
            finished_at: now,
            retrying,
            error,
        };

        let mut inner = self.inner.lock();
        if success {
            inner.total_succeeded += 1;
        } else {
            inner.total_failed += 1;
        }
        inner.history.push_back(entry);
        while inner.history.len() > self.config.history_size {
            inner.history.pop_front();
        }
        drop(inner);

        Metrics::signal(if success { "succeeded" } else { "failed" });
    }

    /// `(successes, failures)` over the history ring.
    pub fn recent_outcomes(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let successes = inner.history.iter().filter(|e| e.success).count();
        (successes, inner.history.len() - successes)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn last_push(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_push
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Drop every queued signal. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.depth();
        inner.high.clear();
        inner.low.clear();
        drop(inner);

        Metrics::queue_depth(0);
        if dropped > 0 {
            warn!(dropped, "Signal queue cleared");
        }
        dropped
    }

    /// Stop accepting signals and wake every waiting `pop`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.available.notify_waiters();
        info!("Signal queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            depth: inner.depth(),
            high: inner.high.len(),
            low: inner.low.len(),
            capacity: self.config.capacity,
            closed: inner.closed,
            total_pushed: inner.total_pushed,
            total_displaced: inner.total_displaced,
            total_rejected: inner.total_rejected,
            total_requeued: inner.total_requeued,
            total_processed: inner.total_succeeded + inner.total_failed,
            total_succeeded: inner.total_succeeded,
            total_failed: inner.total_failed,
            last_push: inner.last_push,
        }
    }
}
