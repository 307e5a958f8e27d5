//! Transport abstraction used by the admission layer.
//!
//! Admission talks to a [`Transport`] rather than the pool directly so it can
//! be driven by a fake in tests.

use crate::error::WsResult;
use crate::message::{ApiResponse, Method};
use crate::pool::SessionPool;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future type for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request path to the broker.
pub trait Transport: Send + Sync {
    /// Pick a healthy session and issue one request on it.
    ///
    /// Waiting for a session is bounded by the pool deadline; `timeout`
    /// bounds only the request itself.
    fn request(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> BoxFuture<'_, WsResult<ApiResponse>>;

    /// Wait until a healthy session is available again.
    fn repair(&self) -> BoxFuture<'_, WsResult<()>>;

    /// Sessions currently usable.
    fn healthy_sessions(&self) -> usize;
}

pub type DynTransport = Arc<dyn Transport>;

impl Transport for SessionPool {
    fn request(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> BoxFuture<'_, WsResult<ApiResponse>> {
        Box::pin(async move {
            let session = self.get().await?;
            session.send_with(method, params, timeout).await
        })
    }

    fn repair(&self) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move { self.get().await.map(|_| ()) })
    }

    fn healthy_sessions(&self) -> usize {
        self.healthy_count()
    }
}
