//! REST insert into the operation log table.

use crate::error::{PersistenceError, PersistenceResult};
use crate::OperationSink;
use digit_core::Operation;
use futures_util::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Directory of the fallback journal.
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
}

fn default_table() -> String {
    "operation_logs".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_journal_dir() -> String {
    "data/operations".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            table: default_table(),
            timeout_ms: default_timeout_ms(),
            journal_dir: default_journal_dir(),
        }
    }
}

/// Inserts records with `POST {db_url}/rest/v1/{table}`.
pub struct RestOperationStore {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl RestOperationStore {
    pub fn new(db_url: &str, api_key: impl Into<String>, config: &PersistenceConfig) -> PersistenceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| PersistenceError::Http(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", db_url.trim_end_matches('/'), config.table),
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn insert(&self, record: &Operation) -> PersistenceResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=minimal")
            .json(record)
            .send()
            .await
            .map_err(|e| PersistenceError::Http(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %body, "Operation insert rejected");
            return Err(PersistenceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(
            bot_name = %record.bot_name,
            result = %record.operation_result,
            profit = %record.profit,
            "Operation persisted"
        );
        Ok(())
    }
}

impl OperationSink for RestOperationStore {
    fn persist<'a>(&'a self, record: &'a Operation) -> BoxFuture<'a, PersistenceResult<()>> {
        Box::pin(self.insert(record))
    }
}
