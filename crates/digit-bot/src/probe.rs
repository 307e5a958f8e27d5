//! Health probe over the running core.

use digit_gate::{Admission, BreakerState};
use digit_monitor::{resident_memory_bytes, HealthProbe, HealthSample};
use digit_pipeline::{SignalQueue, WorkerPool};
use digit_ws::SessionPool;
use std::sync::Arc;

pub struct CoreProbe {
    pool: SessionPool,
    admission: Arc<Admission>,
    queue: Arc<SignalQueue>,
    workers: Arc<WorkerPool>,
}

impl CoreProbe {
    pub fn new(
        pool: SessionPool,
        admission: Arc<Admission>,
        queue: Arc<SignalQueue>,
        workers: Arc<WorkerPool>,
    ) -> Self {
        Self {
            pool,
            admission,
            queue,
            workers,
        }
    }
}

impl HealthProbe for CoreProbe {
    fn sample(&self) -> HealthSample {
        let (recent_successes, recent_failures) = self.queue.recent_outcomes();
        HealthSample {
            queue_depth: self.queue.depth(),
            active_workers: self.workers.active_workers(),
            healthy_sessions: self.pool.healthy_count(),
            breaker_open: self.admission.breaker().state() == BreakerState::Open,
            last_ping: self.pool.last_pong(),
            recent_successes,
            recent_failures,
            last_signal: self.queue.last_push(),
            resident_memory_bytes: resident_memory_bytes(),
        }
    }
}
