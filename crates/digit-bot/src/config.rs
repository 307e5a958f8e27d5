//! Application configuration.
//!
//! Tunables come from a TOML file; secrets come only from the environment.

use crate::error::{AppError, AppResult};
use digit_executor::ExecutorConfig;
use digit_gate::{AdmissionConfig, BreakerConfig, RateLimiterConfig, RateWindow};
use digit_monitor::{HealthMonitorConfig, StatusServerConfig};
use digit_persistence::PersistenceConfig;
use digit_pipeline::{QueueConfig, WorkerPoolConfig};
use digit_ws::{PoolConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const CONFIG_ENV: &str = "DIGIT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ============================================================================
// Sections
// ============================================================================

/// Broker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
}

fn default_broker_url() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
        }
    }
}

/// Per-session timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub request_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub ping_latency_threshold_ms: u64,
    pub max_ping_failures: u32,
    pub write_spacing_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            request_timeout_ms: defaults.request_timeout_ms,
            ping_interval_ms: defaults.ping_interval_ms,
            ping_timeout_ms: defaults.ping_timeout_ms,
            ping_latency_threshold_ms: defaults.ping_latency_threshold_ms,
            max_ping_failures: defaults.max_ping_failures,
            write_spacing_ms: defaults.write_spacing_ms,
            connect_timeout_ms: defaults.connect_timeout_ms,
            reconnect_base_delay_ms: defaults.reconnect_base_delay_ms,
            reconnect_max_delay_ms: defaults.reconnect_max_delay_ms,
            reconnect_jitter_ms: defaults.reconnect_jitter_ms,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub size: usize,
    pub get_deadline_ms: u64,
    pub retry_interval_ms: u64,
    pub rebuild_cooldown_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            size: defaults.size,
            get_deadline_ms: defaults.get_deadline_ms,
            retry_interval_ms: defaults.retry_interval_ms,
            rebuild_cooldown_ms: defaults.rebuild_cooldown_ms,
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.size,
            get_deadline_ms: self.get_deadline_ms,
            retry_interval_ms: self.retry_interval_ms,
            rebuild_cooldown_ms: self.rebuild_cooldown_ms,
        }
    }
}

/// Admission: semaphores, rate windows and breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    pub global_permits: usize,
    pub buy_permits: usize,
    pub poll_permits: usize,
    /// Windows keyed by method name. Listed methods replace the defaults.
    pub rate_limits: HashMap<String, RateWindow>,
    pub default_rate_limit: RateWindow,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for GateSection {
    fn default() -> Self {
        let admission = AdmissionConfig::default();
        Self {
            global_permits: admission.global_permits,
            buy_permits: admission.buy_permits,
            poll_permits: admission.poll_permits,
            rate_limits: HashMap::new(),
            default_rate_limit: admission.rate_limits.default_window,
            jitter_min_ms: admission.rate_limits.jitter_min_ms,
            jitter_max_ms: admission.rate_limits.jitter_max_ms,
            failure_threshold: admission.breaker.failure_threshold,
            recovery_timeout_ms: admission.breaker.recovery_timeout_ms,
            half_open_max_calls: admission.breaker.half_open_max_calls,
        }
    }
}

impl GateSection {
    pub fn to_admission_config(&self) -> AdmissionConfig {
        let mut windows = RateLimiterConfig::default().windows;
        windows.extend(self.rate_limits.clone());

        AdmissionConfig {
            global_permits: self.global_permits,
            buy_permits: self.buy_permits,
            poll_permits: self.poll_permits,
            rate_limits: RateLimiterConfig {
                windows,
                default_window: self.default_rate_limit,
                jitter_min_ms: self.jitter_min_ms,
                jitter_max_ms: self.jitter_max_ms,
            },
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                recovery_timeout_ms: self.recovery_timeout_ms,
                half_open_max_calls: self.half_open_max_calls,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter directives; `RUST_LOG` overrides them.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// AppConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub gate: GateSection,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub workers: WorkerPoolConfig,
    #[serde(default)]
    pub monitor: HealthMonitorConfig,
    #[serde(default)]
    pub status: StatusServerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// How long shutdown waits for in-flight signals.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

fn default_shutdown_drain_ms() -> u64 {
    30_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            session: SessionSection::default(),
            pool: PoolSection::default(),
            gate: GateSection::default(),
            executor: ExecutorConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            monitor: HealthMonitorConfig::default(),
            status: StatusServerConfig::default(),
            persistence: PersistenceConfig::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_drain_ms: default_shutdown_drain_ms(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, then `DIGIT_CONFIG`, then the default path.
    /// A missing default file yields the built-in defaults.
    pub fn load(path: Option<&str>) -> AppResult<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::from_file(&path);
        }
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::from_file(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config {path}: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.broker.url.is_empty() {
            return Err(AppError::Config("broker.url must be set".to_string()));
        }
        if self.pool.size == 0 {
            return Err(AppError::Config("pool.size must be at least 1".to_string()));
        }
        if self.workers.workers == 0 {
            return Err(AppError::Config("workers.workers must be at least 1".to_string()));
        }
        if self.queue.capacity == 0 {
            return Err(AppError::Config("queue.capacity must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.monitor.failure_rate_threshold) {
            return Err(AppError::Config(
                "monitor.failure_rate_threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Session settings for the pool. Credentials are applied here.
    pub fn session_config(&self, app_id: Option<String>, token: Option<String>) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            url: self.broker.url.clone(),
            app_id,
            token,
            request_timeout_ms: s.request_timeout_ms,
            ping_interval_ms: s.ping_interval_ms,
            ping_timeout_ms: s.ping_timeout_ms,
            ping_latency_threshold_ms: s.ping_latency_threshold_ms,
            max_ping_failures: s.max_ping_failures,
            write_spacing_ms: s.write_spacing_ms,
            connect_timeout_ms: s.connect_timeout_ms,
            reconnect_base_delay_ms: s.reconnect_base_delay_ms,
            reconnect_max_delay_ms: s.reconnect_max_delay_ms,
            reconnect_jitter_ms: s.reconnect_jitter_ms,
            max_reconnect_attempts: s.max_reconnect_attempts,
            ..SessionConfig::default()
        }
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Secrets read from the environment at startup.
#[derive(Clone)]
pub struct Credentials {
    pub app_id: String,
    pub api_token: String,
    pub db_url: String,
    pub db_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("api_token", &"<redacted>")
            .field("db_url", &self.db_url)
            .field("db_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Every value is required; empty counts as missing.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| -> AppResult<String> {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(AppError::MissingEnv(name))
        };

        Ok(Self {
            app_id: require("APP_ID")?,
            api_token: require("API_TOKEN")?,
            db_url: require("DB_URL")?,
            db_key: require("DB_KEY")?,
        })
    }
}
