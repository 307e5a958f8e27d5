//! Read-only status server.

use crate::error::{MonitorError, MonitorResult};
use crate::health::HealthMonitor;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use digit_telemetry::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Supplies the `/status` document.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> Value;
}

impl StatusSource for HealthMonitor {
    fn status(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusServerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_enabled() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl StatusServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

type SharedSource = Arc<dyn StatusSource>;

pub fn create_router(source: SharedSource) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .layer(cors)
        .with_state(source)
}

async fn get_status(State(source): State<SharedSource>) -> Json<Value> {
    Json(source.status())
}

async fn get_metrics() -> Response {
    match Metrics::encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve until `cancel` fires.
pub async fn run_server(
    source: SharedSource,
    config: StatusServerConfig,
    cancel: CancellationToken,
) -> MonitorResult<()> {
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| MonitorError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(addr = %addr, "Status server listening");

    axum::serve(listener, create_router(source))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(MonitorError::Serve)?;

    info!("Status server stopped");
    Ok(())
}
