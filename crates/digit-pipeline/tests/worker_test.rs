//! Worker pool tests with scripted handlers.

use digit_core::Signal;
use digit_pipeline::{
    HandlerError, PipelineError, QueueConfig, SignalHandler, SignalQueue, WorkerPool,
    WorkerPoolConfig,
};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Behaviour = fn(&Signal) -> Result<bool, HandlerError>;

struct Recording {
    delay: Duration,
    behaviour: Behaviour,
    seen: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Recording {
    fn new(delay: Duration, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            delay,
            behaviour,
            seen: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn seen(&self) -> Vec<Value> {
        self.seen.lock().clone()
    }
}

impl SignalHandler for Recording {
    fn handle<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, Result<bool, HandlerError>> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().push(signal.payload.clone());
            (self.behaviour)(signal)
        })
    }
}

fn succeed(_: &Signal) -> Result<bool, HandlerError> {
    Ok(true)
}

fn setup(
    workers: usize,
    permits: usize,
    handler: Arc<Recording>,
) -> (Arc<SignalQueue>, WorkerPool) {
    let queue = Arc::new(SignalQueue::new(QueueConfig::default()));
    let pool = WorkerPool::new(
        WorkerPoolConfig {
            workers,
            max_concurrent_operations: permits,
            stall_after_ms: 5_000,
            requeue_on_error: true,
        },
        queue.clone(),
        handler,
    );
    (queue, pool)
}

async fn wait_processed(queue: &SignalQueue, n: u64) {
    for _ in 0..1_000 {
        if queue.stats().total_processed >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("processed {} of {n}", queue.stats().total_processed);
}

#[tokio::test(start_paused = true)]
async fn test_processes_every_signal() {
    let handler = Recording::new(Duration::from_millis(10), succeed);
    let (queue, pool) = setup(2, 2, handler.clone());
    pool.start().unwrap();

    for n in 0..5 {
        queue.push(Signal::low_priority(json!({ "n": n })));
    }
    wait_processed(&queue, 5).await;

    assert_eq!(handler.seen().len(), 5);
    assert_eq!(queue.stats().total_succeeded, 5);
    assert!(queue.is_empty());
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_processed_first() {
    let handler = Recording::new(Duration::from_millis(10), succeed);
    let (queue, pool) = setup(1, 1, handler.clone());

    for n in 0..3 {
        queue.push(Signal::low_priority(json!({ "low": n })));
    }
    for n in 0..2 {
        queue.push(Signal::high_priority(json!({ "high": n })));
    }
    pool.start().unwrap();
    wait_processed(&queue, 5).await;

    let seen = handler.seen();
    assert_eq!(seen[0], json!({"high": 0}));
    assert_eq!(seen[1], json!({"high": 1}));
    assert_eq!(seen[2], json!({"low": 0}));
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_operation_semaphore_bounds_handlers() {
    let handler = Recording::new(Duration::from_secs(1), succeed);
    let (queue, pool) = setup(4, 2, handler.clone());
    for n in 0..8 {
        queue.push(Signal::low_priority(json!({ "n": n })));
    }
    pool.start().unwrap();
    wait_processed(&queue, 8).await;

    assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failure_is_requeued() {
    fn flaky(signal: &Signal) -> Result<bool, HandlerError> {
        if signal.retry_count == 0 {
            Err(HandlerError::retryable("socket dropped"))
        } else {
            Ok(true)
        }
    }
    let handler = Recording::new(Duration::ZERO, flaky);
    let (queue, pool) = setup(1, 1, handler.clone());
    queue.push(Signal::high_priority(json!({})));
    pool.start().unwrap();
    wait_processed(&queue, 2).await;

    let history = queue.history();
    assert!(!history[0].success);
    assert_eq!(history[0].error.as_deref(), Some("socket dropped"));
    assert!(history[0].retrying);
    assert!(history[1].success);
    assert!(!history[1].retrying);
    assert_eq!(history[1].retry_count, 1);
    assert_eq!(queue.stats().total_requeued, 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_and_panic_are_recorded() {
    fn fragile(signal: &Signal) -> Result<bool, HandlerError> {
        match signal.payload["mode"].as_str() {
            Some("panic") => panic!("strategy bug"),
            Some("reject") => Err(HandlerError::terminal("InvalidStake")),
            _ => Ok(true),
        }
    }
    let handler = Recording::new(Duration::ZERO, fragile);
    let (queue, pool) = setup(1, 1, handler);
    queue.push(Signal::low_priority(json!({"mode": "panic"})));
    queue.push(Signal::low_priority(json!({"mode": "reject"})));
    queue.push(Signal::low_priority(json!({"mode": "ok"})));
    pool.start().unwrap();
    wait_processed(&queue, 3).await;

    let stats = queue.stats();
    assert_eq!(stats.total_failed, 2);
    assert_eq!(stats.total_succeeded, 1);
    assert_eq!(stats.total_requeued, 0);
    assert_eq!(
        queue.history()[0].error.as_deref(),
        Some("handler panicked")
    );
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_worker_detected_and_reset() {
    let handler = Recording::new(Duration::from_secs(3_600), succeed);
    let (queue, pool) = setup(1, 1, handler);
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.active_workers(), 1);

    queue.push(Signal::low_priority(json!({})));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pool.active_workers(), 0);
    assert_eq!(pool.processing(), 1);

    pool.reset().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.active_workers(), 1);
    assert_eq!(pool.processing(), 0);
    assert_eq!(pool.stats().restarts, 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_errors_and_idempotent_shutdown() {
    let handler = Recording::new(Duration::ZERO, succeed);
    let (_queue, pool) = setup(2, 2, handler);
    pool.start().unwrap();
    assert_eq!(pool.start(), Err(PipelineError::AlreadyStarted));

    pool.shutdown(Duration::from_secs(1)).await;
    let first = pool.stats();
    pool.shutdown(Duration::from_secs(1)).await;
    let second = pool.stats();

    assert!(!first.running);
    assert_eq!(first.active, second.active);
    assert_eq!(pool.start(), Err(PipelineError::ShutDown));
    assert_eq!(pool.reset(), Err(PipelineError::ShutDown));
}
