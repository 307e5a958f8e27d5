//! Order executor.
//!
//! Drives one trade through the broker: `proposal` (cache first), `buy`
//! against the quote, then `proposal_open_contract` polls until the broker
//! reports the contract sold. Every call goes through the admission layer,
//! so breaker, semaphores and rate windows apply to each attempt.

use crate::cache::{CacheStats, ProposalCache};
use crate::error::{ExecutorError, ExecutorResult};
use crate::quota::{OpenContracts, Reconciled};
use crate::retry::RetryPolicy;
use digit_core::{ContractId, ContractKind, ContractParams};
use digit_gate::{CallError, RpcClient};
use digit_telemetry::Metrics;
use digit_ws::{
    requests, BuyReceipt, Method, OpenContractState, Portfolio, ProposalQuote, TickHistory,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub retry: RetryPolicy,
    pub max_open_per_kind: usize,
    pub poll_interval_ms: u64,
    /// Default settlement deadline for [`OrderExecutor::execute`] callers.
    pub settle_timeout_ms: u64,
    pub proposal_ttl_ms: u64,
    /// Period of the background portfolio resync. 0 disables it.
    pub resync_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_open_per_kind: 5,
            poll_interval_ms: 1_000,
            settle_timeout_ms: 120_000,
            proposal_ttl_ms: 5_000,
            resync_interval_ms: 60_000,
        }
    }
}

impl ExecutorConfig {
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_ms > 0).then(|| Duration::from_millis(self.resync_interval_ms))
    }
}

/// Accepted buy.
#[derive(Debug, Clone, PartialEq)]
pub struct BuyOutcome {
    pub contract_id: ContractId,
    pub contract_type: ContractKind,
    pub stake: Decimal,
    pub buy_price: Decimal,
    pub longcode: Option<String>,
    pub transaction_id: Option<String>,
}

/// Broker-settled contract.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledOutcome {
    pub contract_id: ContractId,
    pub profit: Decimal,
    pub buy_price: Decimal,
    pub sell_price: Option<Decimal>,
    pub polls: u32,
}

/// Result of a full proposal -> buy -> settle run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub proposal: ProposalQuote,
    pub buy: BuyOutcome,
    pub settlement: SettledOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub proposals: u64,
    pub buys: u64,
    pub settled: u64,
    pub settle_timeouts: u64,
    pub api_errors: u64,
    pub open_contracts: BTreeMap<String, usize>,
    pub proposal_cache: CacheStats,
}

pub struct OrderExecutor {
    rpc: Arc<dyn RpcClient>,
    config: ExecutorConfig,
    cache: ProposalCache,
    open: OpenContracts,
    proposals: AtomicU64,
    buys: AtomicU64,
    settled: AtomicU64,
    settle_timeouts: AtomicU64,
    api_errors: AtomicU64,
}

impl OrderExecutor {
    pub fn new(rpc: Arc<dyn RpcClient>, config: ExecutorConfig) -> Self {
        Self {
            cache: ProposalCache::new(Duration::from_millis(config.proposal_ttl_ms)),
            open: OpenContracts::new(config.max_open_per_kind),
            rpc,
            config,
            proposals: AtomicU64::new(0),
            buys: AtomicU64::new(0),
            settled: AtomicU64::new(0),
            settle_timeouts: AtomicU64::new(0),
            api_errors: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn open_contracts(&self) -> &OpenContracts {
        &self.open
    }

    pub fn proposal_cache(&self) -> &ProposalCache {
        &self.cache
    }

    /// One call, payload decoded. Broker `error` payloads become `Api`.
    async fn call_parse<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Value,
        timeout: Duration,
    ) -> ExecutorResult<T> {
        let response = self.rpc.call(method.clone(), params, timeout).await?;
        match response.parse::<T>() {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(api)) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    method = %method,
                    code = %api.code,
                    message = %api.message,
                    "Broker rejected request"
                );
                Err(ExecutorError::Api {
                    code: api.code,
                    message: api.message,
                })
            }
            Err(e) => Err(ExecutorError::InvalidResponse(e.to_string())),
        }
    }

    /// Price `params`, serving a cached quote when one is still fresh.
    pub async fn proposal(&self, params: &ContractParams) -> ExecutorResult<ProposalQuote> {
        params.validate()?;
        let key = params.fingerprint();
        if let Some(quote) = self.cache.get(&key) {
            debug!(proposal_id = %quote.id, "Proposal cache hit");
            return Ok(quote);
        }

        let request =
            requests::proposal(params).map_err(|e| ExecutorError::InvalidParams(e.to_string()))?;
        let timeout = self.config.retry.attempt_timeout();
        let quote: ProposalQuote = self
            .config
            .retry
            .run("proposal", |_| {
                self.call_parse(Method::Proposal, request.clone(), timeout)
            })
            .await?;

        self.proposals.fetch_add(1, Ordering::Relaxed);
        info!(
            symbol = %params.symbol,
            contract_type = %params.contract_type,
            proposal_id = %quote.id,
            ask_price = %quote.ask_price,
            payout = %quote.payout,
            "Proposal received"
        );
        self.cache.put(key, quote.clone());
        Ok(quote)
    }

    /// Buy directly from `params`, without a proposal round-trip.
    pub async fn buy(&self, params: &ContractParams) -> ExecutorResult<BuyOutcome> {
        params.validate()?;
        let request =
            requests::buy_direct(params).map_err(|e| ExecutorError::InvalidParams(e.to_string()))?;
        self.submit_buy(params, request).await
    }

    /// Buy a quoted proposal at its ask price.
    pub async fn buy_proposal(
        &self,
        quote: &ProposalQuote,
        params: &ContractParams,
    ) -> ExecutorResult<BuyOutcome> {
        let request = requests::buy_proposal(&quote.id, quote.ask_price);
        self.submit_buy(params, request).await
    }

    async fn submit_buy(
        &self,
        params: &ContractParams,
        request: Value,
    ) -> ExecutorResult<BuyOutcome> {
        let reservation = self.open.reserve(&params.contract_type)?;
        let timeout = self.config.retry.attempt_timeout();

        // Each attempt is a new call and therefore carries a new req_id.
        let receipt: BuyReceipt = self
            .config
            .retry
            .run("buy", |attempt| {
                debug!(attempt, contract_type = %params.contract_type, "Sending buy");
                self.call_parse(Method::Buy, request.clone(), timeout)
            })
            .await?;

        reservation.commit(receipt.contract_id.clone());
        self.buys.fetch_add(1, Ordering::Relaxed);
        info!(
            contract_id = %receipt.contract_id,
            contract_type = %params.contract_type,
            buy_price = %receipt.buy_price,
            "Contract bought"
        );

        Ok(BuyOutcome {
            contract_id: receipt.contract_id,
            contract_type: params.contract_type.clone(),
            stake: params.amount,
            buy_price: receipt.buy_price,
            longcode: receipt.longcode,
            transaction_id: receipt.transaction_id,
        })
    }

    /// Poll `contract_id` every `poll_interval` until sold or `deadline`.
    ///
    /// Failed polls are logged and retried on the next tick. On timeout the
    /// contract stays registered as open.
    pub async fn poll_until_settled(
        &self,
        contract_id: &ContractId,
        deadline: Duration,
    ) -> ExecutorResult<SettledOutcome> {
        let deadline_at = Instant::now() + deadline;
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let request = requests::open_contract(contract_id);
        let mut polls = 0u32;

        loop {
            polls += 1;
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            let timeout = self
                .config
                .retry
                .attempt_timeout()
                .min(remaining)
                .max(Duration::from_millis(1));

            match self
                .call_parse::<OpenContractState>(
                    Method::ProposalOpenContract,
                    request.clone(),
                    timeout,
                )
                .await
            {
                Ok(state) if state.is_sold => return Ok(self.settle(contract_id, state, polls)),
                Ok(state) => {
                    debug!(contract_id = %contract_id, polls, status = ?state.status, "Contract open")
                }
                Err(ExecutorError::Call(e))
                    if !matches!(e, CallError::Cancelled | CallError::Closed) =>
                {
                    warn!(contract_id = %contract_id, polls, error = %e, "Poll failed");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline_at {
                self.settle_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    contract_id = %contract_id,
                    polls,
                    deadline_ms = deadline.as_millis() as u64,
                    "Contract not settled before deadline"
                );
                return Err(ExecutorError::SettleTimeout(contract_id.clone()));
            }
            tokio::time::sleep(interval.min(deadline_at - now)).await;
        }
    }

    fn settle(
        &self,
        contract_id: &ContractId,
        state: OpenContractState,
        polls: u32,
    ) -> SettledOutcome {
        let kind = self.open.remove(contract_id).or(state.contract_type);
        let buy_price = state.buy_price.unwrap_or_default();
        let profit = match (state.profit, state.sell_price) {
            (Some(profit), _) => profit,
            (None, Some(sell)) => sell - buy_price,
            (None, None) => Decimal::ZERO,
        };
        let result = if profit > Decimal::ZERO { "win" } else { "loss" };
        if let Some(kind) = &kind {
            Metrics::trade_settled(kind.as_str(), result);
        }
        self.settled.fetch_add(1, Ordering::Relaxed);
        info!(contract_id = %contract_id, profit = %profit, polls, result, "Contract settled");

        SettledOutcome {
            contract_id: contract_id.clone(),
            profit,
            buy_price,
            sell_price: state.sell_price,
            polls,
        }
    }

    /// Proposal, buy, then wait up to `deadline` for settlement.
    pub async fn execute(
        &self,
        params: &ContractParams,
        deadline: Duration,
    ) -> ExecutorResult<ExecutionReport> {
        params.validate()?;
        self.open.check(&params.contract_type)?;

        let quote = self.proposal(params).await?;
        let bought = self.buy_proposal(&quote, params).await;
        // A proposal id is single-use once it has been sent to `buy`.
        self.cache.invalidate(&params.fingerprint());
        let buy = bought?;

        let settlement = self.poll_until_settled(&buy.contract_id, deadline).await?;
        Ok(ExecutionReport {
            proposal: quote,
            buy,
            settlement,
        })
    }

    pub async fn portfolio(&self) -> ExecutorResult<Portfolio> {
        let timeout = self.config.retry.attempt_timeout();
        self.config
            .retry
            .run("portfolio", |_| {
                self.call_parse(Method::Portfolio, requests::portfolio(), timeout)
            })
            .await
    }

    /// Reconcile the open set with the broker's portfolio.
    ///
    /// Unsold contracts are registered. Tracked contracts the broker no
    /// longer lists are released, which frees the quota held by contracts
    /// whose settlement poll timed out.
    pub async fn resync_open_contracts(&self) -> ExecutorResult<Reconciled> {
        let candidates = self.open.ids();
        let portfolio = self.portfolio().await?;
        let unsold = portfolio
            .contracts
            .into_iter()
            .filter(|c| !c.is_sold)
            .map(|c| (c.contract_id, c.contract_type));
        let outcome = self.open.reconcile(&candidates, unsold);
        info!(
            added = outcome.added,
            released = outcome.released,
            open = self.open.total(),
            "Open contracts resynced"
        );
        Ok(outcome)
    }

    /// Last `count` tick prices for `symbol`.
    pub async fn ticks_history(&self, symbol: &str, count: u32) -> ExecutorResult<Vec<Decimal>> {
        let timeout = self.config.retry.attempt_timeout();
        let history: TickHistory = self
            .config
            .retry
            .run("ticks_history", |_| {
                self.call_parse(
                    Method::TicksHistory,
                    requests::ticks_history(symbol, count),
                    timeout,
                )
            })
            .await?;
        Ok(history.prices)
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            proposals: self.proposals.load(Ordering::Relaxed),
            buys: self.buys.load(Ordering::Relaxed),
            settled: self.settled.load(Ordering::Relaxed),
            settle_timeouts: self.settle_timeouts.load(Ordering::Relaxed),
            api_errors: self.api_errors.load(Ordering::Relaxed),
            open_contracts: self.open.snapshot(),
            proposal_cache: self.cache.stats(),
        }
    }
}
