//! The `Core` value owned by `main`.
//!
//! Every shared component lives here and is handed to the others by `Arc`.
//! The status server reads through the same value.

use crate::config::{AppConfig, Credentials};
use crate::error::AppResult;
use crate::handler::TradeHandler;
use crate::probe::CoreProbe;
use digit_core::{Signal, SignalId};
use digit_executor::OrderExecutor;
use digit_gate::Admission;
use digit_monitor::{run_server, HealthMonitor, RecoveryAction, StatusSource};
use digit_persistence::{JournaledStore, JsonlJournal, OperationSink, RestOperationStore};
use digit_pipeline::{HistoryEntry, PushOutcome, SignalQueue, WorkerPool};
use digit_ws::{SessionConfig, SessionPool};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Core {
    config: AppConfig,
    pool: SessionPool,
    admission: Arc<Admission>,
    executor: Arc<OrderExecutor>,
    queue: Arc<SignalQueue>,
    workers: Arc<WorkerPool>,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
    restart: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl Core {
    /// Production wiring: credentials from the environment, REST store with a
    /// journal fallback.
    pub fn build(config: AppConfig, credentials: &Credentials) -> AppResult<Self> {
        let store = RestOperationStore::new(
            &credentials.db_url,
            credentials.db_key.clone(),
            &config.persistence,
        )?;
        let journal = JsonlJournal::new(&config.persistence.journal_dir)?;
        let sink: Arc<dyn OperationSink> = Arc::new(JournaledStore::new(Arc::new(store), journal));

        let session = config.session_config(
            Some(credentials.app_id.clone()),
            Some(credentials.api_token.clone()),
        );
        Ok(Self::with_sink(config, session, sink))
    }

    pub fn with_sink(
        config: AppConfig,
        session: SessionConfig,
        sink: Arc<dyn OperationSink>,
    ) -> Self {
        let pool = SessionPool::new(session, config.pool.to_pool_config());
        let admission = Arc::new(Admission::new(
            Arc::new(pool.clone()),
            config.gate.to_admission_config(),
        ));
        let executor = Arc::new(OrderExecutor::new(
            admission.clone(),
            config.executor.clone(),
        ));
        let queue = Arc::new(SignalQueue::new(config.queue.clone()));
        let handler = Arc::new(TradeHandler::new(
            executor.clone(),
            sink,
            config.executor.settle_timeout(),
        ));
        let workers = Arc::new(WorkerPool::new(
            config.workers.clone(),
            queue.clone(),
            handler,
        ));
        let probe = Arc::new(CoreProbe::new(
            pool.clone(),
            admission.clone(),
            queue.clone(),
            workers.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(config.monitor.clone(), probe));

        let core = Self {
            config,
            pool,
            admission,
            executor,
            queue,
            workers,
            monitor,
            cancel: CancellationToken::new(),
            restart: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        };
        core.register_recoveries();
        core
    }

    fn register_recoveries(&self) {
        let queue = self.queue.clone();
        self.monitor.on_recovery(RecoveryAction::ClearQueue, move || {
            let cleared = queue.clear();
            info!(cleared, "Recovery: queue cleared");
            async { true }.boxed()
        });

        let pool = self.pool.clone();
        self.monitor.on_recovery(RecoveryAction::RebuildPool, move || {
            let rebuilt = pool.rebuild_all("health monitor");
            info!(rebuilt, "Recovery: pool rebuild scheduled");
            async move { rebuilt > 0 }.boxed()
        });

        let breaker = self.admission.breaker().clone();
        self.monitor.on_recovery(RecoveryAction::ResetBreaker, move || {
            breaker.reset();
            info!("Recovery: breaker reset");
            async { true }.boxed()
        });

        let workers = self.workers.clone();
        self.monitor.on_recovery(RecoveryAction::ResetWorkers, move || {
            let result = workers.reset();
            if let Err(e) = &result {
                warn!(error = %e, "Recovery: worker reset failed");
            }
            let ok = result.is_ok();
            async move { ok }.boxed()
        });

        let restart = self.restart.clone();
        self.monitor.on_recovery(RecoveryAction::Restart, move || {
            error!("Recovery exhausted, requesting restart");
            restart.cancel();
            async { true }.boxed()
        });
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    pub fn executor(&self) -> &Arc<OrderExecutor> {
        &self.executor
    }

    pub fn queue(&self) -> &Arc<SignalQueue> {
        &self.queue
    }

    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Cancelled on shutdown. Long-running helpers should stop on it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the monitor orders a restart.
    pub async fn restart_requested(&self) {
        self.restart.cancelled().await;
    }

    pub fn is_restart_requested(&self) -> bool {
        self.restart.is_cancelled()
    }

    /// Connect the pool, resync open contracts, then start the workers,
    /// the monitor and the status server.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let connected = self.pool.start().await?;
        if connected == 0 {
            warn!(size = self.pool.size(), "No session connected at startup, slots will keep rebuilding");
        } else {
            info!(connected, size = self.pool.size(), "Session pool started");
        }

        match self.executor.resync_open_contracts().await {
            Ok(outcome) => info!(added = outcome.added, "Open contracts discovered"),
            Err(e) => warn!(error = %e, "Open contract resync failed"),
        }

        self.workers.start()?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.monitor.clone().run(self.cancel.child_token()),
        ));

        if let Some(every) = self.config.executor.resync_interval() {
            tasks.push(tokio::spawn(resync_loop(
                self.executor.clone(),
                every,
                self.cancel.child_token(),
            )));
        }

        if self.config.status.enabled {
            let source: Arc<dyn StatusSource> = self.clone();
            let config = self.config.status.clone();
            let cancel = self.cancel.child_token();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_server(source, config, cancel).await {
                    error!(error = %e, "Status server failed");
                }
            }));
        }

        info!(
            workers = self.workers.worker_count(),
            queue_capacity = self.config.queue.capacity,
            "Core started"
        );
        Ok(())
    }

    pub fn submit(&self, signal: Signal) -> PushOutcome {
        self.queue.push(signal)
    }

    /// Wait for the final history entry of `signal_id`, skipping attempts
    /// that were requeued.
    ///
    /// Returns `None` if it does not appear within `timeout`.
    pub async fn wait_for_outcome(
        &self,
        signal_id: &SignalId,
        timeout: Duration,
    ) -> Option<HistoryEntry> {
        let find = || {
            self.queue
                .history()
                .into_iter()
                .find(|entry| &entry.signal_id == signal_id && !entry.retrying)
        };

        let wait = async {
            let mut tick = tokio::time::interval(Duration::from_millis(50));
            loop {
                tick.tick().await;
                if let Some(entry) = find() {
                    return entry;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Stop intake, drain workers up to `shutdown_drain_ms`, then close the
    /// admission layer and the pool. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Core shutting down");

        self.cancel.cancel();
        self.queue.close();
        self.workers
            .shutdown(Duration::from_millis(self.config.shutdown_drain_ms))
            .await;
        self.admission.close();
        self.pool.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Core stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Monitor snapshot plus the counters of every layer.
    pub fn snapshot(&self) -> Value {
        json!({
            "monitor": self.monitor.snapshot(),
            "queue": self.queue.stats(),
            "history": self.queue.history(),
            "workers": self.workers.stats(),
            "admission": self.admission.stats(),
            "executor": self.executor.stats(),
            "pool": self.pool.stats(),
        })
    }
}

/// Reconcile open contracts with the broker every `every` until cancelled.
async fn resync_loop(executor: Arc<OrderExecutor>, every: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once and startup has just resynced.
    tick.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        match executor.resync_open_contracts().await {
            Ok(outcome) if outcome.released > 0 || outcome.added > 0 => {
                info!(added = outcome.added, released = outcome.released, "Periodic resync changed open contracts");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Periodic resync failed"),
        }
    }
}

impl StatusSource for Core {
    fn status(&self) -> Value {
        self.snapshot()
    }
}
