//! Worker pool draining the signal queue.
//!
//! Each worker loops `pop -> handle -> record`. Handler invocations are
//! bounded by an operation semaphore that is independent of the RPC-level
//! permits. A handler that panics is recorded as a failure; the worker
//! keeps running.

use crate::error::{HandlerError, PipelineError, PipelineResult};
use crate::queue::{PushOutcome, SignalQueue};
use digit_core::Signal;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processes one signal.
///
/// `Ok(true)` is a success, `Ok(false)` a failure that should not be
/// retried. A retryable [`HandlerError`] sends the signal back to the queue.
pub trait SignalHandler: Send + Sync {
    fn handle<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, Result<bool, HandlerError>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub max_concurrent_operations: usize,
    /// A worker whose loop has not ticked for this long counts as inactive.
    pub stall_after_ms: u64,
    pub requeue_on_error: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_concurrent_operations: 2,
            stall_after_ms: 180_000,
            requeue_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub workers: usize,
    pub active: usize,
    pub processing: usize,
    pub restarts: u64,
    pub running: bool,
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: Arc<SignalQueue>,
    handler: Arc<dyn SignalHandler>,
    operations: Semaphore,
    last_tick: Mutex<Vec<Option<Instant>>>,
    processing: AtomicUsize,
}

/// Decrements `processing` even when the task is aborted mid-handler.
struct ProcessingGuard<'a>(&'a AtomicUsize);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl PoolInner {
    fn touch(&self, worker: usize) {
        if let Some(slot) = self.last_tick.lock().get_mut(worker) {
            *slot = Some(Instant::now());
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "Worker started");
        loop {
            self.touch(worker);
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                signal = self.queue.pop() => signal,
            };
            match signal {
                Some(signal) => self.process(worker, signal).await,
                None if self.queue.is_closed() => break,
                None => {}
            }
        }
        debug!(worker, "Worker stopped");
    }

    async fn process(&self, worker: usize, signal: Signal) {
        let Ok(_permit) = self.operations.acquire().await else {
            return;
        };
        self.processing.fetch_add(1, Ordering::Relaxed);
        let _guard = ProcessingGuard(&self.processing);
        let started = Instant::now();

        let result = AssertUnwindSafe(self.handler.handle(&signal))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(true)) => {
                debug!(worker, signal_id = %signal.signal_id, elapsed_ms, "Signal processed");
                self.queue.record_outcome(&signal, true, None);
            }
            Ok(Ok(false)) => {
                info!(worker, signal_id = %signal.signal_id, elapsed_ms, "Signal handled without success");
                self.queue
                    .record_outcome(&signal, false, Some("handler reported failure".to_string()));
            }
            Ok(Err(e)) => {
                warn!(
                    worker,
                    signal_id = %signal.signal_id,
                    retryable = e.retryable,
                    error = %e,
                    "Signal handler failed"
                );
                if e.retryable && self.config.requeue_on_error {
                    match self.queue.requeue(signal.clone()) {
                        PushOutcome::Rejected(reason) => {
                            debug!(worker, %reason, "Requeue rejected");
                            self.queue.record_outcome(&signal, false, Some(e.message));
                        }
                        _ => self.queue.record_retry(&signal, e.message),
                    }
                } else {
                    self.queue.record_outcome(&signal, false, Some(e.message));
                }
            }
            Err(_) => {
                error!(worker, signal_id = %signal.signal_id, "Signal handler panicked");
                self.queue
                    .record_outcome(&signal, false, Some("handler panicked".to_string()));
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
    shut_down: AtomicBool,
    restarts: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<SignalQueue>,
        handler: Arc<dyn SignalHandler>,
    ) -> Self {
        let workers = config.workers.max(1);
        let permits = config.max_concurrent_operations.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                queue,
                handler,
                operations: Semaphore::new(permits),
                last_tick: Mutex::new(vec![None; workers]),
                processing: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            restarts: AtomicU64::new(0),
        }
    }

    pub fn start(&self) -> PipelineResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PipelineError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyStarted);
        }
        *self.running.lock() = Some(self.spawn_workers());
        info!(workers = self.worker_count(), "Worker pool started");
        Ok(())
    }

    fn spawn_workers(&self) -> Running {
        let cancel = CancellationToken::new();
        let tasks = (0..self.worker_count())
            .map(|worker| {
                tokio::spawn(self.inner.clone().run_worker(worker, cancel.clone()))
            })
            .collect();
        Running { cancel, tasks }
    }

    pub fn worker_count(&self) -> usize {
        self.inner.last_tick.lock().len()
    }

    /// Workers whose loop ticked within `stall_after`.
    pub fn active_workers(&self) -> usize {
        if self.running.lock().is_none() {
            return 0;
        }
        let stall_after = Duration::from_millis(self.inner.config.stall_after_ms);
        let now = Instant::now();
        self.inner
            .last_tick
            .lock()
            .iter()
            .flatten()
            .filter(|tick| now.saturating_duration_since(**tick) <= stall_after)
            .count()
    }

    pub fn processing(&self) -> usize {
        self.inner.processing.load(Ordering::Relaxed)
    }

    /// Abort every worker and start a fresh set.
    ///
    /// Signals being handled by an aborted worker are lost.
    pub fn reset(&self) -> PipelineResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PipelineError::ShutDown);
        }
        let mut running = self.running.lock();
        if let Some(old) = running.take() {
            old.cancel.cancel();
            for task in &old.tasks {
                task.abort();
            }
        }
        self.inner.last_tick.lock().iter_mut().for_each(|t| *t = None);
        *running = Some(self.spawn_workers());
        self.started.store(true, Ordering::SeqCst);
        let restarts = self.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(restarts, "Worker pool reset");
        Ok(())
    }

    /// Stop workers after their current signal, waiting up to `drain`.
    ///
    /// Workers still busy after `drain` are aborted. Idempotent.
    pub async fn shutdown(&self, drain: Duration) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();

        let deadline = Instant::now() + drain;
        let mut aborted = 0;
        for mut task in running.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        self.inner.operations.close();
        info!(aborted, "Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            workers: self.worker_count(),
            active: self.active_workers(),
            processing: self.processing(),
            restarts: self.restarts.load(Ordering::Relaxed),
            running: self.is_running(),
        }
    }
}
