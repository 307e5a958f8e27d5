//! Trade handler run by the worker pool.

use chrono::Utc;
use digit_core::{Operation, Signal, TradeIntent};
use digit_executor::{ExecutorError, OrderExecutor};
use digit_persistence::OperationSink;
use digit_pipeline::{HandlerError, SignalHandler};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Turns a signal into one proposal -> buy -> settle run and persists the
/// settled operation.
///
/// Broker rejections, quota refusals and malformed payloads are terminal.
/// Transport-class failures are handed back to the queue for a retry.
pub struct TradeHandler {
    executor: Arc<OrderExecutor>,
    sink: Arc<dyn OperationSink>,
    settle_timeout: Duration,
}

impl TradeHandler {
    pub fn new(
        executor: Arc<OrderExecutor>,
        sink: Arc<dyn OperationSink>,
        settle_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            sink,
            settle_timeout,
        }
    }

    async fn trade(&self, signal: &Signal) -> Result<bool, HandlerError> {
        let intent = match TradeIntent::from_payload(&signal.payload) {
            Ok(intent) => intent,
            Err(e) => {
                warn!(signal_id = %signal.signal_id, error = %e, "Dropping malformed signal");
                return Ok(false);
            }
        };
        let params = intent.contract_params();

        let report = match self.executor.execute(&params, self.settle_timeout).await {
            Ok(report) => report,
            Err(e) if e.is_retryable() => {
                warn!(signal_id = %signal.signal_id, error = %e, "Trade failed, will retry");
                return Err(HandlerError::retryable(e.to_string()));
            }
            Err(ExecutorError::SettleTimeout(contract_id)) => {
                warn!(
                    signal_id = %signal.signal_id,
                    contract_id = %contract_id,
                    "Contract still open at deadline"
                );
                return Ok(false);
            }
            Err(e) => {
                warn!(signal_id = %signal.signal_id, error = %e, "Trade rejected");
                return Ok(false);
            }
        };

        let operation = Operation::from_settlement(
            intent.bot_name.as_str(),
            intent.stake,
            report.settlement.profit,
            Utc::now(),
        );
        info!(
            signal_id = %signal.signal_id,
            contract_id = %report.buy.contract_id,
            contract_type = %params.contract_type,
            profit = %operation.profit,
            result = %operation.operation_result,
            "Trade settled"
        );

        // The trade itself is done; a lost record must not re-run it.
        if let Err(e) = self.sink.persist(&operation).await {
            error!(signal_id = %signal.signal_id, error = %e, "Failed to persist operation");
        }
        Ok(true)
    }
}

impl SignalHandler for TradeHandler {
    fn handle<'a>(&'a self, signal: &'a Signal) -> BoxFuture<'a, Result<bool, HandlerError>> {
        Box::pin(self.trade(signal))
    }
}
