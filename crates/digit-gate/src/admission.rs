//! Admission façade.
//!
//! `call(method, params)` runs, in order: breaker admit, global semaphore,
//! class semaphore (buy or poll), rate window, breaker re-check, transport
//! request. The breaker sees one report per call that reached the network. A connection-level failure is retried
//! once after the transport repairs itself; broker `error` payloads are
//! returned unchanged.

use crate::breaker::{BreakerConfig, BreakerStats, CircuitBreaker, Decision, Outcome};
use crate::error::{CallError, CallResult};
use crate::rate_limiter::{RateLimiter, RateLimiterConfig};
use digit_telemetry::Metrics;
use digit_ws::{ApiResponse, BoxFuture, DynTransport, Method, WsError};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// RPC seam used by the executor.
pub trait RpcClient: Send + Sync {
    /// Issue one admitted call. `timeout` bounds the request itself.
    fn call(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> BoxFuture<'_, CallResult<ApiResponse>>;
}

/// Admission configuration.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub global_permits: usize,
    pub buy_permits: usize,
    pub poll_permits: usize,
    pub rate_limits: RateLimiterConfig,
    pub breaker: BreakerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            global_permits: 10,
            buy_permits: 3,
            poll_permits: 8,
            rate_limits: RateLimiterConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Breaker admission that must be reported exactly once.
///
/// Dropping it unreported hands a half-open slot back.
struct BreakerTicket<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    reported: bool,
}

impl<'a> BreakerTicket<'a> {
    /// The breaker may have opened while the call waited for permits or its
    /// rate window. Nothing is sent unless it still admits the call.
    fn recheck(&mut self, label: &str) -> CallResult<()> {
        match self.breaker.recheck(self.generation) {
            Decision::Allow { generation } => {
                self.generation = generation;
                Ok(())
            }
            Decision::Deny { half_open } => {
                Metrics::rpc_request(label, "breaker_open");
                debug!(method = %label, half_open, "Breaker opened while call was queued");
                Err(CallError::BreakerOpen { half_open })
            }
        }
    }

    fn report(mut self, outcome: Outcome) {
        self.reported = true;
        self.breaker
            .report_for(self.generation, outcome, Instant::now());
    }
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.release(self.generation);
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Single entry point for broker RPCs.
pub struct Admission {
    config: AdmissionConfig,
    transport: DynTransport,
    limiter: RateLimiter,
    breaker: Arc<CircuitBreaker>,
    global: Semaphore,
    buy: Semaphore,
    poll: Semaphore,
    shutdown: CancellationToken,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    calls: AtomicU64,
    retries: AtomicU64,
}

impl Admission {
    pub fn new(transport: DynTransport, config: AdmissionConfig) -> Self {
        Self {
            limiter: RateLimiter::new(config.rate_limits.clone()),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            global: Semaphore::new(config.global_permits.max(1)),
            buy: Semaphore::new(config.buy_permits.max(1)),
            poll: Semaphore::new(config.poll_permits.max(1)),
            config,
            transport,
            shutdown: CancellationToken::new(),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn healthy_sessions(&self) -> usize {
        self.transport.healthy_sessions()
    }

    /// Admit and issue one call.
    pub async fn call(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> CallResult<ApiResponse> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(CallError::Closed),
            result = self.admit_and_send(method, params, timeout) => result,
        }
    }

    /// [`Admission::call`] that also stops when `cancel` fires.
    pub async fn call_cancellable(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CallResult<ApiResponse> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(CallError::Cancelled),
            result = self.call(method, params, timeout) => result,
        }
    }

    async fn admit_and_send(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> CallResult<ApiResponse> {
        let label = method.as_str().to_string();
        let generation = match self.breaker.admit() {
            Decision::Allow { generation } => generation,
            Decision::Deny { half_open } => {
                Metrics::rpc_request(&label, "breaker_open");
                debug!(method = %label, half_open, "Call denied by breaker");
                return Err(CallError::BreakerOpen { half_open });
            }
        };
        let mut ticket = BreakerTicket {
            breaker: &self.breaker,
            generation,
            reported: false,
        };

        let _global = self.global.acquire().await.map_err(|_| CallError::Closed)?;
        let _class = self.acquire_class(&method).await?;
        self.limiter.acquire(&method).await;
        ticket.recheck(&label)?;

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);
        let _in_flight = InFlight(&self.in_flight);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let mut result = self
            .transport
            .request(method.clone(), params.clone(), timeout)
            .await;

        let connection_error = match &result {
            Err(e) if e.is_connection_error() => Some(e.to_string()),
            _ => None,
        };
        if let Some(reason) = connection_error {
            warn!(method = %label, error = %reason, "Connection error, repairing before single retry");
            match self.transport.repair().await {
                Ok(()) => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    self.limiter.acquire(&method).await;
                    ticket.recheck(&label)?;
                    result = self.transport.request(method.clone(), params, timeout).await;
                }
                Err(repair_err) => {
                    warn!(method = %label, error = %repair_err, "Transport repair failed");
                }
            }
        }
        Metrics::rpc_latency(&label, started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(response) => {
                if let Some(error) = response.error.as_ref().filter(|e| e.is_rate_limit()) {
                    warn!(method = %label, code = %error.code, "Broker rate limit hit");
                    ticket.report(Outcome::Failure);
                    Metrics::rpc_request(&label, "rate_limited");
                    return Err(CallError::BrokerRateLimited(error.message.clone()));
                }
                ticket.report(Outcome::Success);
                let outcome = if response.is_error() { "api_error" } else { "ok" };
                Metrics::rpc_request(&label, outcome);
                Ok(response)
            }
            Err(WsError::Cancelled) => {
                drop(ticket);
                Metrics::rpc_request(&label, "cancelled");
                Err(CallError::Cancelled)
            }
            Err(e) => {
                ticket.report(Outcome::Failure);
                let error = match e {
                    WsError::Timeout(d) => CallError::Timeout(d),
                    WsError::NoHealthyConnection => CallError::NoHealthyConnection,
                    other => CallError::Transport(other.to_string()),
                };
                warn!(method = %label, error = %error, "Call failed");
                Metrics::rpc_request(&label, error.label());
                Err(error)
            }
        }
    }

    async fn acquire_class(&self, method: &Method) -> CallResult<Option<SemaphorePermit<'_>>> {
        let semaphore = if *method == Method::Buy {
            &self.buy
        } else if method.is_poll() {
            &self.poll
        } else {
            return Ok(None);
        };
        semaphore
            .acquire()
            .await
            .map(Some)
            .map_err(|_| CallError::Closed)
    }

    /// Stop admitting calls and abort waiting ones. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.global.close();
        self.buy.close();
        self.poll.close();
        info!("Admission closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
            calls: self.calls.load(Ordering::Relaxed),
            connection_retries: self.retries.load(Ordering::Relaxed),
            global_available: self.global.available_permits(),
            global_permits: self.config.global_permits,
            buy_available: self.buy.available_permits(),
            poll_available: self.poll.available_permits(),
            healthy_sessions: self.transport.healthy_sessions(),
            breaker: self.breaker.stats(),
        }
    }
}

impl RpcClient for Admission {
    fn call(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> BoxFuture<'_, CallResult<ApiResponse>> {
        Box::pin(Admission::call(self, method, params, timeout))
    }
}

/// Admission statistics.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub calls: u64,
    pub connection_retries: u64,
    pub global_available: usize,
    pub global_permits: usize,
    pub buy_available: usize,
    pub poll_available: usize,
    pub healthy_sessions: usize,
    pub breaker: BreakerStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::rate_limiter::RateWindow;
    use digit_ws::{ApiResponse, Transport, WsResult};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};

    type Script = Box<dyn Fn(&Method, &Value) -> WsResult<ApiResponse> + Send + Sync>;

    /// Scripted transport recording every request it sees.
    struct FakeTransport {
        script: Script,
        queued: Mutex<VecDeque<WsResult<ApiResponse>>>,
        delay: Duration,
        requests: Mutex<Vec<(Method, Value)>>,
        repairs: AtomicUsize,
        active: AtomicUsize,
        peak: Mutex<HashMap<String, usize>>,
        active_by_method: Mutex<HashMap<String, usize>>,
    }

    impl FakeTransport {
        fn new(script: Script) -> Self {
            Self {
                script,
                queued: Mutex::new(VecDeque::new()),
                delay: Duration::ZERO,
                requests: Mutex::new(Vec::new()),
                repairs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: Mutex::new(HashMap::new()),
                active_by_method: Mutex::new(HashMap::new()),
            }
        }

        fn ok() -> Self {
            Self::new(Box::new(|method, _| Ok(response(method, json!({"ok": 1})))))
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Results returned before falling back to the script.
        fn queue(self, results: Vec<WsResult<ApiResponse>>) -> Self {
            self.queued.lock().extend(results);
            self
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }

        fn peak_for(&self, key: &str) -> usize {
            self.peak.lock().get(key).copied().unwrap_or(0)
        }

        fn enter(&self, method: &Method) {
            let total = self.active.fetch_add(1, Ordering::AcqRel) + 1;
            let mut by_method = self.active_by_method.lock();
            let count = by_method.entry(method.to_string()).or_default();
            *count += 1;
            let current = *count;
            drop(by_method);
            let mut peak = self.peak.lock();
            let p = peak.entry("total".to_string()).or_default();
            *p = (*p).max(total);
            let p = peak.entry(method.to_string()).or_default();
            *p = (*p).max(current);
        }

        fn exit(&self, method: &Method) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            if let Some(count) = self.active_by_method.lock().get_mut(method.as_str()) {
                *count -= 1;
            }
        }
    }

    impl Transport for FakeTransport {
        fn request(
            &self,
            method: Method,
            params: Value,
            _timeout: Duration,
        ) -> BoxFuture<'_, WsResult<ApiResponse>> {
            Box::pin(async move {
                self.requests.lock().push((method.clone(), params.clone()));
                self.enter(&method);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.exit(&method);
                let queued = self.queued.lock().pop_front();
                match queued {
                    Some(result) => result,
                    None => (self.script)(&method, &params),
                }
            })
        }

        fn repair(&self) -> BoxFuture<'_, WsResult<()>> {
            self.repairs.fetch_add(1, Ordering::Relaxed);
            Box::pin(async { Ok(()) })
        }

        fn healthy_sessions(&self) -> usize {
            1
        }
    }

    fn response(method: &Method, payload: Value) -> ApiResponse {
        let mut body = json!({"req_id": "1", "msg_type": method.as_str()});
        body[method.as_str()] = payload;
        ApiResponse::from_value(body).unwrap()
    }

    fn api_error(method: &Method, code: &str, message: &str) -> ApiResponse {
        ApiResponse::from_value(json!({
            "req_id": "1",
            "msg_type": method.as_str(),
            "error": {"code": code, "message": message}
        }))
        .unwrap()
    }

    fn relaxed_config() -> AdmissionConfig {
        let mut config = AdmissionConfig::default();
        config.rate_limits.default_window = RateWindow::new(10_000, 60);
        config.rate_limits.windows.clear();
        config
    }

    fn admission(transport: Arc<FakeTransport>) -> Admission {
        Admission::new(transport, relaxed_config())
    }

    const T: Duration = Duration::from_secs(15);

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let transport = Arc::new(FakeTransport::ok());
        let admission = admission(transport.clone());

        let response = admission.call(Method::Proposal, json!({"proposal": 1}), T).await.unwrap();
        assert!(!response.is_error());
        assert_eq!(transport.request_count(), 1);
        assert_eq!(admission.breaker().consecutive_failures(), 0);
        assert_eq!(admission.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_api_error_returned_unchanged_and_counts_as_success() {
        let transport = Arc::new(FakeTransport::new(Box::new(|method, _| {
            Ok(api_error(method, "InvalidStake", "Stake too low"))
        })));
        let admission = admission(transport.clone());
        admission.breaker().report(Outcome::Failure);

        let response = admission.call(Method::Proposal, json!({}), T).await.unwrap();
        assert_eq!(response.error.unwrap().code, "InvalidStake");
        assert_eq!(transport.request_count(), 1);
        assert_eq!(admission.breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_connection_error_retried_once_after_repair() {
        let transport = Arc::new(
            FakeTransport::ok().queue(vec![Err(WsError::ConnectionLost("reset".into()))]),
        );
        let admission = admission(transport.clone());

        admission.call(Method::Buy, json!({"buy": "P1"}), T).await.unwrap();
        assert_eq!(transport.request_count(), 2);
        assert_eq!(transport.repairs.load(Ordering::Relaxed), 1);
        assert_eq!(admission.stats().connection_retries, 1);
        assert_eq!(admission.breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_second_connection_error_surfaces_as_transport() {
        let transport = Arc::new(FakeTransport::new(Box::new(|_, _| {
            Err(WsError::ConnectionLost("reset".into()))
        })));
        let admission = admission(transport.clone());

        let err = admission.call(Method::Buy, json!({}), T).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        assert_eq!(transport.request_count(), 2);
        assert_eq!(admission.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried_here() {
        let transport = Arc::new(FakeTransport::new(Box::new(|_, _| {
            Err(WsError::Timeout(Duration::from_secs(15)))
        })));
        let admission = admission(transport.clone());

        let err = admission.call(Method::Buy, json!({}), T).await.unwrap_err();
        assert_eq!(err, CallError::Timeout(Duration::from_secs(15)));
        assert_eq!(transport.request_count(), 1);
        assert_eq!(transport.repairs.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_broker_rate_limit_is_transport_class() {
        let transport = Arc::new(FakeTransport::new(Box::new(|method, _| {
            Ok(api_error(method, "RateLimit", "You have reached the rate limit for buy."))
        })));
        let admission = admission(transport.clone());

        let err = admission.call(Method::Buy, json!({}), T).await.unwrap_err();
        assert!(matches!(err, CallError::BrokerRateLimited(_)));
        assert!(err.is_retryable());
        assert_eq!(admission.breaker().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_sends_no_frames_and_recovers() {
        let transport = Arc::new(
            FakeTransport::ok().queue(
                (0..5)
                    .map(|_| Err(WsError::Timeout(Duration::from_secs(15))))
                    .collect(),
            ),
        );
        let admission = Arc::new(admission(transport.clone()));

        for _ in 0..5 {
            let err = admission.call(Method::Buy, json!({}), T).await.unwrap_err();
            assert!(matches!(err, CallError::Timeout(_)));
        }
        assert_eq!(admission.breaker().state(), BreakerState::Open);

        let denied = spawn_buys(admission.clone(), 3).await;
        assert!(denied
            .iter()
            .all(|r| matches!(r, Err(CallError::BreakerOpen { half_open: false }))));
        assert_eq!(transport.request_count(), 5);

        tokio::time::advance(Duration::from_secs(120)).await;
        admission.call(Method::Buy, json!({}), T).await.unwrap();
        assert_eq!(admission.breaker().state(), BreakerState::Closed);
        assert_eq!(transport.request_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_during_rate_wait_blocks_send() {
        let transport = Arc::new(FakeTransport::ok());
        let mut config = relaxed_config();
        config
            .rate_limits
            .windows
            .insert("buy".to_string(), RateWindow::new(1, 60));
        let admission = Arc::new(Admission::new(transport.clone(), config));

        admission.call(Method::Buy, json!({}), T).await.unwrap();
        let parked = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.call(Method::Buy, json!({}), T).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!parked.is_finished());

        for _ in 0..5 {
            admission.breaker().report(Outcome::Failure);
        }
        assert_eq!(admission.breaker().state(), BreakerState::Open);

        let result = parked.await.unwrap();
        assert_eq!(result.unwrap_err(), CallError::BreakerOpen { half_open: false });
        assert_eq!(transport.request_count(), 1);
        assert_eq!(admission.stats().in_flight, 0);
    }

    async fn spawn_buys(
        admission: Arc<Admission>,
        n: usize,
    ) -> Vec<CallResult<ApiResponse>> {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let admission = admission.clone();
                tokio::spawn(async move { admission.call(Method::Buy, json!({}), T).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_semaphores_bound_concurrency() {
        let transport = Arc::new(FakeTransport::ok().with_delay(Duration::from_millis(30)));
        let admission = Arc::new(admission(transport.clone()));

        let mut handles = Vec::new();
        for i in 0..30 {
            let admission = admission.clone();
            let method = match i % 3 {
                0 => Method::Buy,
                1 => Method::ProposalOpenContract,
                _ => Method::Proposal,
            };
            handles.push(tokio::spawn(async move {
                admission.call(method, json!({}), T).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(transport.peak_for("total") <= 10);
        assert!(transport.peak_for("buy") <= 3);
        assert!(transport.peak_for("proposal_open_contract") <= 8);
        assert!(admission.stats().peak_in_flight <= 10);
        assert_eq!(transport.request_count(), 30);
    }

    #[tokio::test]
    async fn test_cancel_returns_promptly() {
        let transport = Arc::new(FakeTransport::ok().with_delay(Duration::from_secs(5)));
        let admission = admission(transport.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = admission
            .call_cancellable(Method::Buy, json!({}), T, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Cancelled);
        assert_eq!(admission.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_closed_admission_rejects() {
        let admission = admission(Arc::new(FakeTransport::ok()));
        admission.close();
        admission.close();
        let err = admission.call(Method::Buy, json!({}), T).await.unwrap_err();
        assert_eq!(err, CallError::Closed);
    }
}
