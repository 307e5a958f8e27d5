//! Scripted `RpcClient` for executor tests.

#![allow(dead_code)]

use digit_gate::{CallError, CallResult, RpcClient};
use digit_ws::{ApiResponse, BoxFuture, Method};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

type Script = Box<dyn Fn(&Method, &Value, usize) -> CallResult<ApiResponse> + Send + Sync>;

/// Answers each call from a script keyed by method and per-method call index.
///
/// A scripted `Timeout` waits out the caller's timeout before failing.
pub struct MockRpcClient {
    script: Script,
    latency: Duration,
    calls: Mutex<Vec<(Method, Value)>>,
}

impl MockRpcClient {
    pub fn new(
        script: impl Fn(&Method, &Value, usize) -> CallResult<ApiResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Self::with_latency(Duration::ZERO, script)
    }

    pub fn with_latency(
        latency: Duration,
        script: impl Fn(&Method, &Value, usize) -> CallResult<ApiResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            latency,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(Method, Value)> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: &Method) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }
}

impl RpcClient for MockRpcClient {
    fn call(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> BoxFuture<'_, CallResult<ApiResponse>> {
        let index = {
            let mut calls = self.calls.lock();
            let index = calls.iter().filter(|(m, _)| m == &method).count();
            calls.push((method.clone(), params.clone()));
            index
        };
        let result = (self.script)(&method, &params, index);
        let latency = self.latency;

        Box::pin(async move {
            match &result {
                Err(CallError::Timeout(_)) => tokio::time::sleep(timeout).await,
                _ if !latency.is_zero() => tokio::time::sleep(latency).await,
                _ => {}
            }
            result
        })
    }
}

pub fn ok(msg_type: &str, payload: Value) -> CallResult<ApiResponse> {
    let mut frame = Map::new();
    frame.insert("req_id".to_string(), json!("1"));
    frame.insert("msg_type".to_string(), json!(msg_type));
    frame.insert(msg_type.to_string(), payload);
    Ok(ApiResponse::from_value(Value::Object(frame)).expect("valid frame"))
}

pub fn api_error(msg_type: &str, code: &str, message: &str) -> CallResult<ApiResponse> {
    Ok(ApiResponse::from_value(json!({
        "req_id": "1",
        "msg_type": msg_type,
        "error": {"code": code, "message": message},
    }))
    .expect("valid frame"))
}

pub fn timeout() -> CallResult<ApiResponse> {
    Err(CallError::Timeout(Duration::from_secs(15)))
}

pub fn quote(id: &str) -> CallResult<ApiResponse> {
    ok("proposal", json!({"id": id, "ask_price": 1.0, "payout": 1.95}))
}

pub fn bought(contract_id: &str) -> CallResult<ApiResponse> {
    ok(
        "buy",
        json!({"contract_id": contract_id, "buy_price": 1.0, "longcode": "Win payout", "transaction_id": 77}),
    )
}

pub fn open_state(sold: bool, profit: f64) -> CallResult<ApiResponse> {
    ok(
        "proposal_open_contract",
        json!({"is_sold": sold, "profit": profit, "buy_price": 1.0, "status": if sold { "won" } else { "open" }}),
    )
}
