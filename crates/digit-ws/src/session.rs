//! One authenticated broker socket.
//!
//! A session owns a single WebSocket connection split into a writer task and a
//! reader task. Every outgoing frame goes through one bounded channel consumed
//! by the writer, so at most one frame is being written at a time. The reader
//! resolves waiters in the [`WaiterTable`] by `req_id`.
//!
//! A background prober pings every `ping_interval_ms`. Two consecutive failed
//! probes, or a pong slower than the latency threshold, trigger a reconnect:
//! outstanding waiters fail with `ConnectionLost`, the socket is reopened with
//! exponential backoff and the session re-authorizes.

use crate::correlation::{CorrelationIdGenerator, WaiterGuard, WaiterTable};
use crate::error::{WsError, WsResult};
use crate::heartbeat::{HeartbeatManager, HeartbeatStats, ProbeVerdict};
use crate::message::{envelope, requests, ApiResponse, Method};
use chrono::{DateTime, Utc};
use digit_telemetry::Metrics;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker endpoint, e.g. `wss://ws.example.com/websockets/v3`.
    pub url: String,
    /// Application id appended as `app_id` when the URL lacks one.
    pub app_id: Option<String>,
    /// API token. Without one the session is usable once the socket opens.
    pub token: Option<String>,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    /// Interval between health probes.
    pub ping_interval_ms: u64,
    /// A probe without a response within this counts as failed.
    pub ping_timeout_ms: u64,
    /// A pong slower than this forces a reconnect.
    pub ping_latency_threshold_ms: u64,
    /// Consecutive failed probes that force a reconnect.
    pub max_ping_failures: u32,
    /// Pause after each written frame.
    pub write_spacing_ms: u64,
    /// Timeout for the TCP + TLS + upgrade handshake.
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the random delay added to each backoff.
    pub reconnect_jitter_ms: u64,
    /// Reconnect attempts before the session gives up (0 = infinite).
    pub max_reconnect_attempts: u32,
    /// Capacity of the outbound frame channel.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            app_id: None,
            token: None,
            request_timeout_ms: 15_000,
            ping_interval_ms: 25_000,
            ping_timeout_ms: 10_000,
            ping_latency_threshold_ms: 2_000,
            max_ping_failures: 2,
            write_spacing_ms: 20,
            connect_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter_ms: 1_000,
            max_reconnect_attempts: 5,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// URL actually dialled.
    pub fn endpoint(&self) -> String {
        match &self.app_id {
            Some(app_id) if !self.url.contains("app_id=") => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}app_id={}", self.url, sep, app_id)
            }
            _ => self.url.clone(),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Exponential backoff: base * 2^(attempt-1), capped, plus jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self
            .reconnect_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.reconnect_max_delay_ms);
        let jitter = if self.reconnect_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.reconnect_jitter_ms)
        };
        Duration::from_millis(delay + jitter)
    }
}

/// Socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
    Authorized,
    Failing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Authorized => "authorized",
            SessionState::Failing => "failing",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live socket handles. Replaced on every (re)connect.
#[derive(Debug, Default)]
struct Connection {
    generation: u64,
    token: CancellationToken,
    outbound: Option<mpsc::Sender<Message>>,
}

struct SessionInner {
    id: u64,
    config: SessionConfig,
    state: RwLock<SessionState>,
    ids: Arc<CorrelationIdGenerator>,
    waiters: WaiterTable,
    heartbeat: HeartbeatManager,
    connection: Mutex<Connection>,
    /// Cancelled once by `close()`.
    shutdown: CancellationToken,
    reconnect_lock: TokioMutex<()>,
    reconnects: AtomicU64,
    frames_sent: AtomicU64,
    connected_at: RwLock<Option<DateTime<Utc>>>,
    prober_started: AtomicBool,
}

/// Handle to one broker session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Create a closed session. Call [`Session::connect`] to open it.
    pub fn new(config: SessionConfig, ids: Arc<CorrelationIdGenerator>) -> Self {
        let heartbeat = HeartbeatManager::new(
            Duration::from_millis(config.ping_latency_threshold_ms),
            config.max_ping_failures,
        );
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: RwLock::new(SessionState::Closed),
                ids,
                waiters: WaiterTable::new(),
                heartbeat,
                connection: Mutex::new(Connection::default()),
                shutdown: CancellationToken::new(),
                reconnect_lock: TokioMutex::new(()),
                reconnects: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                connected_at: RwLock::new(None),
                prober_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.inner.state.write(), state);
        if previous != state {
            debug!(session = self.inner.id, from = %previous, to = %state, "Session state");
        }
    }

    /// Authorized and the last health probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.state() == SessionState::Authorized && self.inner.heartbeat.last_probe_ok()
    }

    /// Whether the pool should replace this session.
    ///
    /// A failing session with its own reconnect in progress is left alone.
    pub fn needs_rebuild(&self) -> bool {
        match self.state() {
            SessionState::Closed => true,
            SessionState::Failing => self.inner.reconnect_lock.try_lock().is_ok(),
            SessionState::Authorized => !self.inner.heartbeat.last_probe_ok(),
            SessionState::Connecting | SessionState::Open => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Instant of the last successful probe (or authorization).
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.inner.heartbeat.last_pong()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.waiters.pending_count()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the socket, authorize, and start the health prober.
    pub async fn connect(&self) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::NotConnected("session closed".to_string()));
        }
        self.establish().await?;
        self.start_prober();
        Ok(())
    }

    async fn establish(&self) -> WsResult<()> {
        if let Err(e) = self.open_socket().await {
            self.set_state(SessionState::Failing);
            return Err(e);
        }

        let authorized = match self.inner.config.token.clone() {
            Some(token) => self.authorize(&token).await,
            None => {
                self.set_state(SessionState::Authorized);
                Ok(())
            }
        };
        if let Err(e) = authorized {
            self.teardown("authorization failed");
            self.set_state(SessionState::Failing);
            return Err(e);
        }

        self.inner.heartbeat.reset();
        if self.is_closed() {
            self.teardown("session closed");
            self.set_state(SessionState::Closed);
            return Err(WsError::NotConnected("session closed".to_string()));
        }
        Ok(())
    }

    async fn open_socket(&self) -> WsResult<()> {
        self.set_state(SessionState::Connecting);
        let url = self.inner.config.endpoint();
        info!(session = self.inner.id, url = %self.inner.config.url, "Connecting to broker");

        let connect_timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        let (stream, _response) = tokio::time::timeout(
            connect_timeout,
            connect_async_tls_with_config(url.as_str(), None, true, None),
        )
        .await
        .map_err(|_| {
            WsError::ConnectionFailed(format!("handshake timed out after {connect_timeout:?}"))
        })?
        .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;

        let (sink, source) = stream.split();
        let (tx, rx) = mpsc::channel(self.inner.config.outbound_capacity.max(1));
        let token = self.inner.shutdown.child_token();
        let generation = {
            let mut conn = self.inner.connection.lock();
            conn.token.cancel();
            conn.generation += 1;
            conn.token = token.clone();
            conn.outbound = Some(tx);
            conn.generation
        };

        tokio::spawn(self.clone().run_writer(sink, rx, token.clone(), generation));
        tokio::spawn(self.clone().run_reader(source, token, generation));

        *self.inner.connected_at.write() = Some(Utc::now());
        self.set_state(SessionState::Open);
        info!(session = self.inner.id, generation, "Broker socket open");
        Ok(())
    }

    /// Authorize the open socket with `token`.
    pub async fn authorize(&self, token: &str) -> WsResult<()> {
        let response = self
            .send_with(
                Method::Authorize,
                requests::authorize(token),
                self.inner.config.request_timeout(),
            )
            .await?;
        if let Some(error) = response.error {
            warn!(session = self.inner.id, code = %error.code, "Authorization rejected");
            return Err(WsError::Authorization {
                code: error.code,
                message: error.message,
            });
        }
        self.set_state(SessionState::Authorized);
        info!(session = self.inner.id, "Session authorized");
        Ok(())
    }

    /// Close the session and fail every outstanding waiter. Idempotent.
    pub fn close(&self) {
        if self.is_closed() && self.state() == SessionState::Closed {
            return;
        }
        self.inner.shutdown.cancel();
        let failed = self.teardown("session closed");
        self.set_state(SessionState::Closed);
        info!(session = self.inner.id, failed_waiters = failed, "Session closed");
    }

    /// Drop the current socket and fail its waiters.
    fn teardown(&self, reason: &str) -> usize {
        {
            let mut conn = self.inner.connection.lock();
            conn.token.cancel();
            conn.outbound = None;
        }
        self.inner.waiters.fail_all(reason)
    }

    /// Called by the reader or writer of connection `generation`.
    fn connection_lost(&self, generation: u64, reason: String) {
        {
            let mut conn = self.inner.connection.lock();
            if conn.generation != generation || conn.token.is_cancelled() {
                return;
            }
            conn.token.cancel();
            conn.outbound = None;
        }
        let failed = self.inner.waiters.fail_all(&reason);
        warn!(session = self.inner.id, %reason, failed_waiters = failed, "Connection lost");

        if self.is_closed() {
            return;
        }
        self.set_state(SessionState::Failing);
        let session = self.clone();
        tokio::spawn(async move {
            let _ = session.reconnect("connection_lost").await;
        });
    }

    /// Reopen and re-authorize with exponential backoff.
    ///
    /// Returns immediately if another reconnect is already running.
    pub async fn reconnect(&self, cause: &'static str) -> WsResult<()> {
        let Ok(_guard) = self.inner.reconnect_lock.try_lock() else {
            debug!(session = self.inner.id, "Reconnect already in progress");
            return Ok(());
        };
        Metrics::ws_reconnect(cause);
        self.teardown(cause);

        let max_attempts = self.inner.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        loop {
            if self.is_closed() {
                self.set_state(SessionState::Closed);
                return Err(WsError::NotConnected("session closed".to_string()));
            }
            attempt += 1;

            match self.establish().await {
                Ok(()) => {
                    self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!(session = self.inner.id, attempt, cause, "Session reconnected");
                    return Ok(());
                }
                Err(e) if max_attempts > 0 && attempt >= max_attempts => {
                    error!(session = self.inner.id, attempt, error = %e, "Reconnect attempts exhausted");
                    self.set_state(SessionState::Failing);
                    return Err(WsError::ConnectionFailed(format!(
                        "reconnect failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) => {
                    let delay = self.inner.config.backoff_delay(attempt);
                    warn!(
                        session = self.inner.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.inner.shutdown.cancelled() => {
                            self.set_state(SessionState::Closed);
                            return Err(WsError::NotConnected("session closed".to_string()));
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Send a request with the default timeout.
    pub async fn send(&self, method: Method, params: Value) -> WsResult<ApiResponse> {
        self.send_with(method, params, self.inner.config.request_timeout())
            .await
    }

    /// Send a request and await its correlated response.
    ///
    /// Broker `error` payloads resolve successfully with the error embedded.
    /// On timeout the waiter is removed and `Timeout` is returned.
    pub async fn send_with(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> WsResult<ApiResponse> {
        let state = self.state();
        let ready = match state {
            SessionState::Authorized => true,
            SessionState::Open => method.allowed_unauthorized(),
            _ => false,
        };
        if !ready {
            return Err(WsError::NotConnected(format!(
                "session {} is {state}",
                self.inner.id
            )));
        }
        let outbound = self
            .inner
            .connection
            .lock()
            .outbound
            .clone()
            .ok_or_else(|| WsError::NotConnected(format!("session {} has no socket", self.inner.id)))?;

        let req_id = self.inner.ids.next_id();
        let frame = envelope(params, &method, &req_id)?;
        let rx = self.inner.waiters.register(req_id.clone(), method.clone());
        let _guard = WaiterGuard::new(&self.inner.waiters, req_id.clone());

        let exchange = async {
            if outbound.send(Message::Text(frame)).await.is_err() {
                return Err(WsError::ConnectionLost("writer stopped".to_string()));
            }
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(WsError::ConnectionLost("waiter dropped".to_string())),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(session = self.inner.id, %method, %req_id, "Request timed out");
                Err(WsError::Timeout(timeout))
            }
        }
    }

    /// [`Session::send_with`] that also stops when `cancel` fires.
    pub async fn send_cancellable(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WsResult<ApiResponse> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WsError::Cancelled),
            result = self.send_with(method, params, timeout) => result,
        }
    }

    /// Application-level ping. Returns the round-trip latency.
    pub async fn ping(&self) -> WsResult<Duration> {
        self.inner.heartbeat.record_ping();
        let started = Instant::now();
        self.send_with(
            Method::Ping,
            requests::ping(),
            Duration::from_millis(self.inner.config.ping_timeout_ms),
        )
        .await?;
        Ok(started.elapsed())
    }

    /// Run one health probe and record the verdict.
    pub async fn probe(&self) -> ProbeVerdict {
        match self.ping().await {
            Ok(latency) => {
                Metrics::ping_latency(self.inner.id, latency.as_secs_f64() * 1000.0);
                self.inner.heartbeat.record_pong(latency)
            }
            Err(e) => {
                warn!(session = self.inner.id, error = %e, "Health probe failed");
                self.inner.heartbeat.record_failure()
            }
        }
    }

    fn start_prober(&self) {
        if self.inner.prober_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.clone().run_prober());
    }

    async fn run_prober(self) {
        let period = Duration::from_millis(self.inner.config.ping_interval_ms.max(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.state() != SessionState::Authorized {
                continue;
            }
            if self.probe().await == ProbeVerdict::Reconnect {
                warn!(session = self.inner.id, "Probe verdict: reconnect");
                let _ = self.reconnect("probe").await;
            }
        }
        debug!(session = self.inner.id, "Prober stopped");
    }

    // ------------------------------------------------------------------------
    // Socket tasks
    // ------------------------------------------------------------------------

    async fn run_writer(
        self,
        mut sink: WsSink,
        mut rx: mpsc::Receiver<Message>,
        token: CancellationToken,
        generation: u64,
    ) {
        let spacing = Duration::from_millis(self.inner.config.write_spacing_ms);
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    let _ = tokio::time::timeout(
                        Duration::from_secs(1),
                        sink.send(Message::Close(None)),
                    )
                    .await;
                    break;
                }
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = sink.send(frame).await {
                        self.connection_lost(generation, format!("write failed: {e}"));
                        break;
                    }
                    self.inner.frames_sent.fetch_add(1, Ordering::Relaxed);
                    if !spacing.is_zero() {
                        tokio::time::sleep(spacing).await;
                    }
                }
            }
        }
        debug!(session = self.inner.id, generation, "Writer stopped");
    }

    async fn run_reader(self, mut source: WsSource, token: CancellationToken, generation: u64) {
        loop {
            let frame = tokio::select! {
                biased;
                () = token.cancelled() => break,
                frame = source.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                Some(Ok(Message::Ping(data))) => {
                    let outbound = self.inner.connection.lock().outbound.clone();
                    if let Some(outbound) = outbound {
                        let _ = outbound.try_send(Message::Pong(data));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason): (u16, String) = frame
                        .map(|f| (f.code.into(), f.reason.to_string()))
                        .unwrap_or((1000, "normal close".to_string()));
                    self.connection_lost(
                        generation,
                        format!("closed by broker: code={code}, reason={reason}"),
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.connection_lost(generation, format!("read failed: {e}"));
                    break;
                }
                None => {
                    self.connection_lost(generation, "stream ended".to_string());
                    break;
                }
            }
        }
        debug!(session = self.inner.id, generation, "Reader stopped");
    }

    fn handle_text(&self, text: &str) {
        self.inner.heartbeat.record_message();

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(session = self.inner.id, error = %e, "Dropping unparseable frame");
                return;
            }
        };
        let response = match ApiResponse::from_value(value) {
            Ok(response) => response,
            Err(e) => {
                warn!(session = self.inner.id, error = %e, "Dropping malformed frame");
                return;
            }
        };

        match response.req_id.clone() {
            Some(req_id) => {
                if !self.inner.waiters.resolve(&req_id, response) {
                    warn!(session = self.inner.id, %req_id, "Response for unknown request dropped");
                }
            }
            None => {
                debug!(session = self.inner.id, msg_type = %response.msg_type, "Frame without req_id ignored");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            id: self.inner.id,
            state: self.state(),
            healthy: self.is_healthy(),
            connected_at: *self.inner.connected_at.read(),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            frames_sent: self.inner.frames_sent.load(Ordering::Relaxed),
            pending_requests: self.pending_requests(),
            heartbeat: self.inner.heartbeat.stats(),
        }
    }
}

/// Session statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: u64,
    pub state: SessionState,
    pub healthy: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub reconnects: u64,
    pub frames_sent: u64,
    pub pending_requests: usize,
    pub heartbeat: HeartbeatStats,
}
