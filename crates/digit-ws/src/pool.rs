//! Pool of broker sessions.
//!
//! `get()` hands out sessions round-robin, skipping any that are not
//! authorized or whose last probe failed. Skipped sessions that need it are
//! rebuilt in the background, at most one rebuild per slot at a time. When no
//! session is healthy `get()` waits up to `get_deadline_ms` and then returns
//! `NoHealthyConnection`.

use crate::correlation::CorrelationIdGenerator;
use crate::error::{WsError, WsResult};
use crate::session::{Session, SessionConfig, SessionStats};
use chrono::{DateTime, Utc};
use digit_telemetry::Metrics;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of sessions.
    pub size: usize,
    /// How long `get()` waits for a healthy session.
    pub get_deadline_ms: u64,
    /// Re-check interval while waiting.
    pub retry_interval_ms: u64,
    /// Pause after a failed slot rebuild before the slot may be rebuilt again.
    pub rebuild_cooldown_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            get_deadline_ms: 10_000,
            retry_interval_ms: 100,
            rebuild_cooldown_ms: 1_000,
        }
    }
}

struct Slots {
    sessions: Vec<Session>,
    cursor: usize,
}

struct PoolInner {
    config: PoolConfig,
    session_config: SessionConfig,
    ids: Arc<CorrelationIdGenerator>,
    slots: Mutex<Slots>,
    rebuilding: Vec<AtomicBool>,
    changed: Notify,
    closed: AtomicBool,
    rebuilds: AtomicU64,
}

/// Round-robin pool of sessions sharing one correlation id generator.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(session_config: SessionConfig, config: PoolConfig) -> Self {
        let size = config.size.max(1);
        let ids = Arc::new(CorrelationIdGenerator::new());
        let sessions = (0..size)
            .map(|_| Session::new(session_config.clone(), ids.clone()))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                config,
                session_config,
                ids,
                slots: Mutex::new(Slots {
                    sessions,
                    cursor: 0,
                }),
                rebuilding: (0..size).map(|_| AtomicBool::new(false)).collect(),
                changed: Notify::new(),
                closed: AtomicBool::new(false),
                rebuilds: AtomicU64::new(0),
            }),
        }
    }

    /// Connect every slot concurrently.
    ///
    /// Slots that fail are scheduled for rebuild. Returns the number of
    /// sessions that connected.
    pub async fn start(&self) -> WsResult<usize> {
        if self.is_closed() {
            return Err(WsError::NotConnected("pool shut down".to_string()));
        }
        let sessions = self.sessions();
        let results = join_all(sessions.iter().map(|s| s.connect())).await;

        let mut connected = 0;
        for (slot, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => connected += 1,
                Err(e) => {
                    warn!(slot, error = %e, "Session failed to start");
                    self.schedule_rebuild(slot, "start_failed");
                }
            }
        }
        self.publish_health();
        info!(connected, size = sessions.len(), "Session pool started");
        Ok(connected)
    }

    /// Next healthy session, round-robin, without waiting.
    pub fn try_get(&self) -> Option<Session> {
        let mut stale = Vec::new();
        let found = {
            let mut slots = self.inner.slots.lock();
            let n = slots.sessions.len();
            let mut found = None;
            for _ in 0..n {
                let idx = slots.cursor % n;
                slots.cursor = slots.cursor.wrapping_add(1);
                let session = &slots.sessions[idx];
                if session.is_healthy() {
                    found = Some(session.clone());
                    break;
                }
                if session.needs_rebuild() {
                    stale.push(idx);
                }
            }
            found
        };

        for idx in stale {
            self.schedule_rebuild(idx, "unhealthy");
        }
        found
    }

    /// Healthy session, waiting up to the configured deadline.
    pub async fn get(&self) -> WsResult<Session> {
        let deadline = Instant::now() + Duration::from_millis(self.inner.config.get_deadline_ms);
        let retry = Duration::from_millis(self.inner.config.retry_interval_ms.max(1));

        loop {
            if self.is_closed() {
                return Err(WsError::NotConnected("pool shut down".to_string()));
            }
            let changed = self.inner.changed.notified();
            if let Some(session) = self.try_get() {
                return Ok(session);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    deadline_ms = self.inner.config.get_deadline_ms,
                    "No healthy session before deadline"
                );
                return Err(WsError::NoHealthyConnection);
            }
            tokio::select! {
                () = changed => {}
                () = tokio::time::sleep(retry.min(deadline - now)) => {}
            }
        }
    }

    /// Replace the session in `slot` in the background.
    ///
    /// No-op while a rebuild of the same slot is running.
    pub fn schedule_rebuild(&self, slot: usize, reason: &'static str) {
        if self.is_closed() {
            return;
        }
        let Some(flag) = self.inner.rebuilding.get(slot) else {
            return;
        };
        if flag.swap(true, Ordering::AcqRel) {
            debug!(slot, "Rebuild already in progress");
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            pool.rebuild_slot(slot, reason).await;
            pool.inner.rebuilding[slot].store(false, Ordering::Release);
            pool.inner.changed.notify_waiters();
        });
    }

    /// Schedule a rebuild of every slot. Returns the number scheduled.
    pub fn rebuild_all(&self, reason: &'static str) -> usize {
        let size = self.size();
        let mut scheduled = 0;
        for slot in 0..size {
            if !self.inner.rebuilding[slot].load(Ordering::Acquire) {
                self.schedule_rebuild(slot, reason);
                scheduled += 1;
            }
        }
        info!(scheduled, reason, "Pool rebuild requested");
        scheduled
    }

    async fn rebuild_slot(&self, slot: usize, reason: &'static str) {
        Metrics::ws_reconnect(reason);
        let session = Session::new(self.inner.session_config.clone(), self.inner.ids.clone());
        let old = {
            let mut slots = self.inner.slots.lock();
            std::mem::replace(&mut slots.sessions[slot], session.clone())
        };
        old.close();
        info!(slot, old = old.id(), new = session.id(), reason, "Rebuilding pool slot");

        match session.connect().await {
            Ok(()) => {
                self.inner.rebuilds.fetch_add(1, Ordering::Relaxed);
                if self.is_closed() {
                    session.close();
                }
                info!(slot, session = session.id(), "Pool slot rebuilt");
            }
            Err(e) => {
                warn!(slot, session = session.id(), error = %e, "Pool slot rebuild failed");
                tokio::time::sleep(Duration::from_millis(self.inner.config.rebuild_cooldown_ms))
                    .await;
            }
        }
        self.publish_health();
    }

    /// Close every session and fail their waiters. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for session in self.sessions() {
            session.close();
        }
        self.inner.changed.notify_waiters();
        Metrics::sessions_healthy(0);
        info!("Session pool shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.inner.rebuilding.len()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.slots.lock().sessions.clone()
    }

    pub fn healthy_count(&self) -> usize {
        self.sessions().iter().filter(|s| s.is_healthy()).count()
    }

    /// Most recent successful probe across all sessions.
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.sessions().iter().filter_map(Session::last_pong).max()
    }

    fn publish_health(&self) {
        Metrics::sessions_healthy(self.healthy_count());
    }

    pub fn stats(&self) -> PoolStats {
        let sessions: Vec<SessionStats> = self.sessions().iter().map(Session::stats).collect();
        PoolStats {
            size: sessions.len(),
            healthy: sessions.iter().filter(|s| s.healthy).count(),
            rebuilds: self.inner.rebuilds.load(Ordering::Relaxed),
            last_pong: self.last_pong(),
            sessions,
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub healthy: usize,
    pub rebuilds: u64,
    pub last_pong: Option<DateTime<Utc>>,
    pub sessions: Vec<SessionStats>,
}
