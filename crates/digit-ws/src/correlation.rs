//! Correlation ids and the waiter table.
//!
//! Every request carries a `req_id` produced by [`CorrelationIdGenerator`].
//! The sender registers a one-shot waiter under that id; the session's reader
//! resolves exactly one waiter per response frame.

use crate::error::{WsError, WsResult};
use crate::message::{ApiResponse, Method};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

// ============================================================================
// CorrelationIdGenerator
// ============================================================================

/// Generator for unique request ids.
///
/// Format: `{epoch_ms}_{random}_{counter}`. The counter alone guarantees
/// uniqueness within the process; the timestamp and random part keep ids
/// distinct across restarts.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    counter: AtomicU64,
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let random: u32 = rand::thread_rng().gen_range(1000..10000);
        format!("{}_{}_{}", Utc::now().timestamp_millis(), random, seq)
    }

    /// Ids allocated so far.
    #[must_use]
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed).saturating_sub(1)
    }
}

// ============================================================================
// WaiterTable
// ============================================================================

#[derive(Debug)]
struct PendingWaiter {
    method: Method,
    registered_at: Instant,
    tx: oneshot::Sender<WsResult<ApiResponse>>,
}

/// Pending requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct WaiterTable {
    pending: DashMap<String, PendingWaiter>,
}

impl WaiterTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Register a waiter and return the receiving end.
    pub fn register(
        &self,
        req_id: String,
        method: Method,
    ) -> oneshot::Receiver<WsResult<ApiResponse>> {
        let (tx, rx) = oneshot::channel();
        let waiter = PendingWaiter {
            method,
            registered_at: Instant::now(),
            tx,
        };
        if self.pending.insert(req_id.clone(), waiter).is_some() {
            warn!(%req_id, "Correlation id registered twice, previous waiter dropped");
        }
        rx
    }

    /// Deliver a response to the waiter registered under `req_id`.
    ///
    /// Returns `false` if no such waiter exists (unknown, timed out, or
    /// cancelled).
    pub fn resolve(&self, req_id: &str, response: ApiResponse) -> bool {
        match self.pending.remove(req_id) {
            Some((_, waiter)) => {
                debug!(
                    %req_id,
                    method = %waiter.method,
                    elapsed_ms = waiter.registered_at.elapsed().as_millis() as u64,
                    "Response correlated"
                );
                waiter.tx.send(Ok(response)).is_ok()
            }
            None => false,
        }
    }

    /// Fail the waiter registered under `req_id`.
    pub fn fail(&self, req_id: &str, error: WsError) -> bool {
        match self.pending.remove(req_id) {
            Some((_, waiter)) => waiter.tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Remove a waiter without notifying it.
    pub fn remove(&self, req_id: &str) -> bool {
        self.pending.remove(req_id).is_some()
    }

    /// Fail every outstanding waiter with `ConnectionLost`.
    ///
    /// Returns the number of waiters failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for req_id in ids {
            if let Some((_, waiter)) = self.pending.remove(&req_id) {
                let _ = waiter
                    .tx
                    .send(Err(WsError::ConnectionLost(reason.to_string())));
                failed += 1;
            }
        }
        failed
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Age of the oldest outstanding waiter.
    #[must_use]
    pub fn oldest_pending(&self) -> Option<Duration> {
        self.pending
            .iter()
            .map(|e| e.value().registered_at.elapsed())
            .max()
    }
}

/// Removes a waiter when dropped.
///
/// Held by the sending future so timeouts and cancellation never leave
/// stale entries behind. Removing an already-resolved id is a no-op.
pub struct WaiterGuard<'a> {
    table: &'a WaiterTable,
    req_id: String,
}

impl<'a> WaiterGuard<'a> {
    pub fn new(table: &'a WaiterTable, req_id: String) -> Self {
        Self { table, req_id }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.req_id);
    }
}
