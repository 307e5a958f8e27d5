//! Health classification and recovery.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use digit_telemetry::Metrics;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ============================================================================
// Status / actions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Deadlock,
    ConnectionIssues,
    HighFailureRate,
    Inactivity,
    HighMemory,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Deadlock => "deadlock",
            Self::ConnectionIssues => "connection_issues",
            Self::HighFailureRate => "high_failure_rate",
            Self::Inactivity => "inactivity",
            Self::HighMemory => "high_memory",
        }
    }

    #[inline]
    pub fn is_healthy(&self) -> bool {
        *self == Self::Healthy
    }

    /// Warning-only classes never escalate to a restart.
    pub fn escalates(&self) -> bool {
        !matches!(self, Self::Healthy | Self::HighMemory)
    }

    fn gauge(&self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::HighMemory | Self::Inactivity => 1.0,
            Self::Deadlock | Self::ConnectionIssues | Self::HighFailureRate => 2.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    ClearQueue,
    RebuildPool,
    ResetBreaker,
    ResetWorkers,
    Restart,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClearQueue => "clear_queue",
            Self::RebuildPool => "rebuild_pool",
            Self::ResetBreaker => "reset_breaker",
            Self::ResetWorkers => "reset_workers",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Sampling
// ============================================================================

/// Counters read at each check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSample {
    pub queue_depth: usize,
    pub active_workers: usize,
    pub healthy_sessions: usize,
    pub breaker_open: bool,
    /// Most recent pong across all sessions.
    pub last_ping: Option<DateTime<Utc>>,
    pub recent_successes: usize,
    pub recent_failures: usize,
    pub last_signal: Option<DateTime<Utc>>,
    pub resident_memory_bytes: Option<u64>,
}

/// Source of [`HealthSample`]s.
pub trait HealthProbe: Send + Sync {
    fn sample(&self) -> HealthSample;
}

/// Recovery callback. Resolves to whether the action succeeded.
pub type RecoveryCallback = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    pub check_interval_ms: u64,
    /// Queue depth at which zero active workers means deadlock.
    pub deadlock_queue_depth: usize,
    pub ping_stale_after_ms: u64,
    pub failure_rate_threshold: f64,
    pub failure_rate_min_samples: usize,
    pub inactivity_threshold_ms: u64,
    pub memory_threshold_mb: u64,
    /// Continuous non-healthy time before escalating to restart.
    pub deadlock_threshold_ms: u64,
    pub max_recovery_attempts: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            deadlock_queue_depth: 3,
            ping_stale_after_ms: 60_000,
            failure_rate_threshold: 0.7,
            failure_rate_min_samples: 10,
            inactivity_threshold_ms: 180_000,
            memory_threshold_mb: 500,
            deadlock_threshold_ms: 120_000,
            max_recovery_attempts: 5,
        }
    }
}

fn older_than(at: DateTime<Utc>, now: DateTime<Utc>, ms: u64) -> bool {
    now - at > ChronoDuration::milliseconds(ms as i64)
}

impl HealthMonitorConfig {
    /// First matching class wins. Missing timestamps fall back to `baseline`.
    pub fn classify(
        &self,
        sample: &HealthSample,
        now: DateTime<Utc>,
        baseline: DateTime<Utc>,
    ) -> HealthStatus {
        if sample.queue_depth >= self.deadlock_queue_depth && sample.active_workers == 0 {
            return HealthStatus::Deadlock;
        }

        let last_ping = sample.last_ping.unwrap_or(baseline);
        if sample.healthy_sessions == 0
            || sample.breaker_open
            || older_than(last_ping, now, self.ping_stale_after_ms)
        {
            return HealthStatus::ConnectionIssues;
        }

        let total = sample.recent_successes + sample.recent_failures;
        if total >= self.failure_rate_min_samples.max(1)
            && sample.recent_failures as f64 / total as f64 > self.failure_rate_threshold
        {
            return HealthStatus::HighFailureRate;
        }

        let last_signal = sample.last_signal.unwrap_or(baseline);
        if older_than(last_signal, now, self.inactivity_threshold_ms) {
            return HealthStatus::Inactivity;
        }

        if let Some(bytes) = sample.resident_memory_bytes {
            if bytes > self.memory_threshold_mb * 1024 * 1024 {
                return HealthStatus::HighMemory;
            }
        }

        HealthStatus::Healthy
    }
}

/// Recovery for a classified status, before escalation.
pub fn recovery_for(status: HealthStatus, sample: &HealthSample) -> Option<RecoveryAction> {
    match status {
        HealthStatus::Healthy | HealthStatus::HighMemory => None,
        HealthStatus::Deadlock => Some(RecoveryAction::ResetWorkers),
        HealthStatus::ConnectionIssues if sample.breaker_open && sample.healthy_sessions > 0 => {
            Some(RecoveryAction::ResetBreaker)
        }
        HealthStatus::ConnectionIssues | HealthStatus::Inactivity => {
            Some(RecoveryAction::RebuildPool)
        }
        HealthStatus::HighFailureRate => Some(RecoveryAction::ClearQueue),
    }
}

// ============================================================================
// HealthMonitor
// ============================================================================

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub status: HealthStatus,
    pub action: Option<RecoveryAction>,
    pub action_succeeded: Option<bool>,
    pub escalated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub status: HealthStatus,
    pub checks: u64,
    pub started_at: DateTime<Utc>,
    pub last_check: Option<DateTime<Utc>>,
    pub unhealthy_since: Option<DateTime<Utc>>,
    /// Recoveries fired since the last healthy check.
    pub recovery_attempts: u32,
    pub total_recoveries: u64,
    pub recoveries_by_action: BTreeMap<RecoveryAction, u64>,
    pub escalated: bool,
    pub last_sample: Option<HealthSample>,
    pub last_report: Option<CheckReport>,
}

struct MonitorState {
    status: HealthStatus,
    checks: u64,
    last_check: Option<DateTime<Utc>>,
    unhealthy_since: Option<DateTime<Utc>>,
    recovery_attempts: u32,
    total_recoveries: u64,
    recoveries_by_action: BTreeMap<RecoveryAction, u64>,
    escalated: bool,
    last_sample: Option<HealthSample>,
    last_report: Option<CheckReport>,
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    probe: Arc<dyn HealthProbe>,
    callbacks: Mutex<HashMap<RecoveryAction, RecoveryCallback>>,
    state: Mutex<MonitorState>,
    started_at: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self::with_start(config, probe, Utc::now())
    }

    /// Monitor whose missing ping/signal timestamps count from `started_at`.
    pub fn with_start(
        config: HealthMonitorConfig,
        probe: Arc<dyn HealthProbe>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            probe,
            callbacks: Mutex::new(HashMap::new()),
            state: Mutex::new(MonitorState {
                status: HealthStatus::Healthy,
                checks: 0,
                last_check: None,
                unhealthy_since: None,
                recovery_attempts: 0,
                total_recoveries: 0,
                recoveries_by_action: BTreeMap::new(),
                escalated: false,
                last_sample: None,
                last_report: None,
            }),
            started_at,
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Register the callback fired for `action`, replacing any previous one.
    pub fn on_recovery<F>(&self, action: RecoveryAction, callback: F)
    where
        F: Fn() -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        self.callbacks.lock().insert(action, Arc::new(callback));
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    /// Sample, classify and recover once, as of `now`.
    pub async fn check_at(&self, now: DateTime<Utc>) -> CheckReport {
        let sample = self.probe.sample();
        let status = self.config.classify(&sample, now, self.started_at);

        let (action, escalated) = {
            let mut state = self.state.lock();
            state.checks += 1;
            state.last_check = Some(now);
            if status != state.status {
                info!(from = %state.status, to = %status, "Health status changed");
            }
            state.status = status;

            if status.is_healthy() {
                state.unhealthy_since = None;
                state.recovery_attempts = 0;
            } else {
                state.unhealthy_since.get_or_insert(now);
            }

            let persistent = state.unhealthy_since.is_some_and(|since| {
                older_than(since, now, self.config.deadlock_threshold_ms)
            });
            let exhausted = state.recovery_attempts >= self.config.max_recovery_attempts;
            let escalated = status.escalates() && (persistent || exhausted);
            if escalated {
                state.escalated = true;
            }
            state.last_sample = Some(sample.clone());

            let action = if escalated {
                Some(RecoveryAction::Restart)
            } else {
                recovery_for(status, &sample)
            };
            (action, escalated)
        };

        Metrics::health_status(if escalated { 3.0 } else { status.gauge() });
        match status {
            HealthStatus::Healthy => debug!(?sample, "Health check passed"),
            HealthStatus::HighMemory => warn!(
                resident_bytes = sample.resident_memory_bytes,
                threshold_mb = self.config.memory_threshold_mb,
                "High memory usage"
            ),
            _ => warn!(status = %status, ?sample, "Health check failed"),
        }

        let action_succeeded = match action {
            Some(action) => Some(self.fire(action, escalated).await),
            None => None,
        };

        let report = CheckReport {
            status,
            action,
            action_succeeded,
            escalated,
        };
        self.state.lock().last_report = Some(report.clone());
        report
    }

    pub async fn check(&self) -> CheckReport {
        self.check_at(Utc::now()).await
    }

    async fn fire(&self, action: RecoveryAction, escalated: bool) -> bool {
        {
            let mut state = self.state.lock();
            state.recovery_attempts += 1;
            state.total_recoveries += 1;
            *state.recoveries_by_action.entry(action).or_insert(0) += 1;
        }
        Metrics::recovery(action.as_str());

        let callback = self.callbacks.lock().get(&action).cloned();
        let Some(callback) = callback else {
            warn!(action = %action, "No recovery callback registered");
            return false;
        };

        if escalated {
            error!(action = %action, "Recovery escalated");
        } else {
            info!(action = %action, "Running recovery");
        }
        let ok = callback().await;
        if !ok {
            warn!(action = %action, "Recovery action failed");
        }
        ok
    }

    /// Check every `check_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_millis(self.config.check_interval_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "Health monitor started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check().await;
                }
            }
        }
        info!("Health monitor stopped");
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state.lock();
        MonitorSnapshot {
            status: state.status,
            checks: state.checks,
            started_at: self.started_at,
            last_check: state.last_check,
            unhealthy_since: state.unhealthy_since,
            recovery_attempts: state.recovery_attempts,
            total_recoveries: state.total_recoveries,
            recoveries_by_action: state.recoveries_by_action.clone(),
            escalated: state.escalated,
            last_sample: state.last_sample.clone(),
            last_report: state.last_report.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn healthy(now: DateTime<Utc>) -> HealthSample {
        HealthSample {
            queue_depth: 0,
            active_workers: 2,
            healthy_sessions: 2,
            breaker_open: false,
            last_ping: Some(now),
            recent_successes: 10,
            recent_failures: 0,
            last_signal: Some(now),
            resident_memory_bytes: Some(50 * 1024 * 1024),
        }
    }

    fn classify(sample: &HealthSample, now: DateTime<Utc>) -> HealthStatus {
        HealthMonitorConfig::default().classify(sample, now, t0())
    }

    #[test]
    fn test_healthy_sample() {
        assert_eq!(classify(&healthy(t0()), t0()), HealthStatus::Healthy);
    }

    #[test]
    fn test_deadlock_takes_precedence() {
        let sample = HealthSample {
            queue_depth: 3,
            active_workers: 0,
            healthy_sessions: 0,
            ..healthy(t0())
        };
        assert_eq!(classify(&sample, t0()), HealthStatus::Deadlock);
        assert_eq!(
            recovery_for(HealthStatus::Deadlock, &sample),
            Some(RecoveryAction::ResetWorkers)
        );
    }

    #[test]
    fn test_connection_issues() {
        let now = t0() + ChronoDuration::seconds(61);
        let stale = HealthSample {
            last_ping: Some(t0()),
            last_signal: Some(now),
            ..healthy(now)
        };
        assert_eq!(classify(&stale, now), HealthStatus::ConnectionIssues);
        assert_eq!(
            recovery_for(HealthStatus::ConnectionIssues, &stale),
            Some(RecoveryAction::RebuildPool)
        );

        let breaker = HealthSample {
            breaker_open: true,
            ..healthy(t0())
        };
        assert_eq!(classify(&breaker, t0()), HealthStatus::ConnectionIssues);
        assert_eq!(
            recovery_for(HealthStatus::ConnectionIssues, &breaker),
            Some(RecoveryAction::ResetBreaker)
        );

        let no_sessions = HealthSample {
            healthy_sessions: 0,
            breaker_open: true,
            ..healthy(t0())
        };
        assert_eq!(
            recovery_for(HealthStatus::ConnectionIssues, &no_sessions),
            Some(RecoveryAction::RebuildPool)
        );
    }

    #[test]
    fn test_failure_rate_needs_min_samples() {
        let few = HealthSample {
            recent_successes: 1,
            recent_failures: 8,
            ..healthy(t0())
        };
        assert_eq!(classify(&few, t0()), HealthStatus::Healthy);

        let many = HealthSample {
            recent_successes: 2,
            recent_failures: 8,
            ..healthy(t0())
        };
        assert_eq!(classify(&many, t0()), HealthStatus::HighFailureRate);

        let boundary = HealthSample {
            recent_successes: 3,
            recent_failures: 7,
            ..healthy(t0())
        };
        assert_eq!(classify(&boundary, t0()), HealthStatus::Healthy);
    }

    #[test]
    fn test_inactivity_and_memory() {
        let now = t0() + ChronoDuration::seconds(181);
        let idle = HealthSample {
            last_signal: Some(t0()),
            ..healthy(now)
        };
        assert_eq!(classify(&idle, now), HealthStatus::Inactivity);

        let never = HealthSample {
            last_signal: None,
            ..healthy(now)
        };
        assert_eq!(classify(&never, now), HealthStatus::Inactivity);

        let heavy = HealthSample {
            resident_memory_bytes: Some(600 * 1024 * 1024),
            ..healthy(t0())
        };
        assert_eq!(classify(&heavy, t0()), HealthStatus::HighMemory);
        assert_eq!(recovery_for(HealthStatus::HighMemory, &heavy), None);
        assert!(!HealthStatus::HighMemory.escalates());
    }
}
