//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] digit_ws::WsError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] digit_pipeline::PipelineError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] digit_monitor::MonitorError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] digit_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] digit_persistence::PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::MissingEnv(_) => 2,
            _ => 1,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
