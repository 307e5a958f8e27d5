//! Order executor tests over a scripted RPC client.

mod common;

use common::{api_error, bought, ok, open_state, quote, timeout, MockRpcClient};
use digit_core::{ContractId, ContractParams};
use digit_executor::{ExecutorConfig, ExecutorError, OrderExecutor, Reconciled, RetryPolicy};
use digit_gate::CallError;
use digit_ws::Method;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn params() -> ContractParams {
    ContractParams::digit("DIGITDIFF", "R_100", dec!(1.0), Some(0), 1)
}

fn new_executor(rpc: Arc<MockRpcClient>) -> OrderExecutor {
    OrderExecutor::new(rpc, ExecutorConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_execute_happy_path() {
    let rpc = MockRpcClient::new(|method, _, i| match method {
        Method::Proposal => quote("P1"),
        Method::Buy => bought("C1"),
        Method::ProposalOpenContract => open_state(i >= 2, if i >= 2 { 0.95 } else { 0.0 }),
        other => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc.clone());

    let report = executor
        .execute(&params(), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(report.proposal.id, "P1");
    assert_eq!(report.buy.contract_id, ContractId::new("C1"));
    assert_eq!(report.buy.stake, dec!(1.0));
    assert_eq!(report.settlement.profit, dec!(0.95));
    assert_eq!(report.settlement.polls, 3);
    assert!(executor.open_contracts().is_empty());

    assert_eq!(rpc.count(&Method::Proposal), 1);
    assert_eq!(rpc.count(&Method::Buy), 1);
    assert_eq!(rpc.count(&Method::ProposalOpenContract), 3);

    let buy_request = &rpc.calls()[1].1;
    assert_eq!(buy_request, &json!({"buy": "P1", "price": 1.0}));

    let stats = executor.stats();
    assert_eq!(stats.settled, 1);
    assert_eq!(stats.proposal_cache.entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_proposal_rejection_is_not_retried() {
    let rpc = MockRpcClient::new(|method, _, _| match method {
        Method::Proposal => api_error("proposal", "InvalidStake", "Stake too low"),
        other => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc.clone());

    let err = executor
        .execute(&params(), Duration::from_secs(60))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutorError::Api {
            code: "InvalidStake".into(),
            message: "Stake too low".into()
        }
    );
    assert_eq!(rpc.count(&Method::Proposal), 1);
    assert_eq!(rpc.count(&Method::Buy), 0);
    assert_eq!(executor.stats().api_errors, 1);
}

#[tokio::test(start_paused = true)]
async fn test_buy_retried_after_timeout() {
    let rpc = MockRpcClient::new(|method, _, i| match method {
        Method::Buy if i == 0 => timeout(),
        Method::Buy => bought("C1"),
        other => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc.clone());

    let outcome = executor.buy(&params()).await.unwrap();
    assert_eq!(outcome.contract_id, ContractId::new("C1"));
    assert_eq!(rpc.count(&Method::Buy), 2);
    assert!(executor.open_contracts().contains(&ContractId::new("C1")));
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_bounds_elapsed_time() {
    let rpc = MockRpcClient::new(|_, _, _| timeout());
    let executor = OrderExecutor::new(
        rpc.clone(),
        ExecutorConfig {
            retry: RetryPolicy {
                attempt_timeout_ms: 1_000,
                ..RetryPolicy::default()
            },
            ..ExecutorConfig::default()
        },
    );

    let started = Instant::now();
    let err = executor.buy(&params()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ExecutorError::Call(CallError::Timeout(_))));
    assert_eq!(rpc.count(&Method::Buy), 3);
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(executor.open_contracts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_is_terminal_half_open_is_retried() {
    let rpc = MockRpcClient::new(|_, _, _| Err(CallError::BreakerOpen { half_open: false }));
    let executor = new_executor(rpc.clone());
    let err = executor.buy(&params()).await.unwrap_err();
    assert_eq!(err, ExecutorError::Call(CallError::BreakerOpen { half_open: false }));
    assert_eq!(rpc.count(&Method::Buy), 1);

    let rpc = MockRpcClient::new(|_, _, i| {
        if i == 0 {
            Err(CallError::BreakerOpen { half_open: true })
        } else {
            bought("C9")
        }
    });
    let executor = new_executor(rpc.clone());
    executor.buy(&params()).await.unwrap();
    assert_eq!(rpc.count(&Method::Buy), 2);
}

#[tokio::test(start_paused = true)]
async fn test_quota_rejects_before_network() {
    let rpc = MockRpcClient::new(|_, _, i| bought(&format!("C{i}")));
    let executor = OrderExecutor::new(
        rpc.clone(),
        ExecutorConfig {
            max_open_per_kind: 2,
            ..ExecutorConfig::default()
        },
    );

    executor.buy(&params()).await.unwrap();
    executor.buy(&params()).await.unwrap();
    let err = executor.buy(&params()).await.unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::QuotaExceeded { open: 2, limit: 2, .. }
    ));
    assert_eq!(rpc.count(&Method::Buy), 2);

    let accumulator = ContractParams::accumulator("R_100", dec!(1), dec!(0.03), None);
    executor.buy(&accumulator).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_buys_respect_quota() {
    let rpc = MockRpcClient::with_latency(Duration::from_millis(500), |_, _, i| {
        bought(&format!("C{i}"))
    });
    let executor = OrderExecutor::new(
        rpc.clone(),
        ExecutorConfig {
            max_open_per_kind: 1,
            ..ExecutorConfig::default()
        },
    );
    let p = params();

    let (a, b, c) = tokio::join!(executor.buy(&p), executor.buy(&p), executor.buy(&p));
    let succeeded = [a, b, c].into_iter().filter(Result::is_ok).count();

    assert_eq!(succeeded, 1);
    assert_eq!(rpc.count(&Method::Buy), 1);
    assert_eq!(executor.open_contracts().total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_deadline_keeps_contract_open() {
    let rpc = MockRpcClient::new(|method, _, _| match method {
        Method::Buy => bought("C1"),
        _ => open_state(false, 0.0),
    });
    let executor = new_executor(rpc.clone());
    let buy = executor.buy(&params()).await.unwrap();

    let err = executor
        .poll_until_settled(&buy.contract_id, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert_eq!(err, ExecutorError::SettleTimeout(ContractId::new("C1")));
    assert!(executor.open_contracts().contains(&ContractId::new("C1")));
    assert_eq!(executor.stats().settle_timeouts, 1);
    assert!(rpc.count(&Method::ProposalOpenContract) >= 5);
}

#[tokio::test(start_paused = true)]
async fn test_failed_polls_are_retried() {
    let rpc = MockRpcClient::new(|method, _, i| match (method, i) {
        (Method::ProposalOpenContract, 0) => timeout(),
        (Method::ProposalOpenContract, 1) => Err(CallError::NoHealthyConnection),
        (Method::ProposalOpenContract, _) => open_state(true, -1.0),
        (other, _) => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc.clone());

    let settled = executor
        .poll_until_settled(&ContractId::new("42"), Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(settled.profit, dec!(-1));
    assert_eq!(settled.polls, 3);
    assert_eq!(rpc.calls()[0].1["contract_id"], 42);
}

#[tokio::test(start_paused = true)]
async fn test_poll_rejection_bubbles() {
    let rpc = MockRpcClient::new(|_, _, _| {
        api_error("proposal_open_contract", "InvalidContractId", "Unknown contract")
    });
    let executor = new_executor(rpc);

    let err = executor
        .poll_until_settled(&ContractId::new("1"), Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(err.is_api_error());
}

#[tokio::test(start_paused = true)]
async fn test_proposal_cached_within_ttl() {
    let rpc = MockRpcClient::new(|_, _, i| quote(&format!("P{i}")));
    let executor = new_executor(rpc.clone());

    let first = executor.proposal(&params()).await.unwrap();
    let second = executor.proposal(&params()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(rpc.count(&Method::Proposal), 1);

    let other = ContractParams::digit("DIGITDIFF", "R_100", dec!(2.0), Some(0), 1);
    executor.proposal(&other).await.unwrap();
    assert_eq!(rpc.count(&Method::Proposal), 2);

    tokio::time::advance(Duration::from_secs(6)).await;
    let refreshed = executor.proposal(&params()).await.unwrap();
    assert_ne!(refreshed.id, first.id);
    assert_eq!(rpc.count(&Method::Proposal), 3);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_params_never_reach_network() {
    let rpc = MockRpcClient::new(|_, _, _| quote("P1"));
    let executor = new_executor(rpc.clone());

    let mut bad = params();
    bad.barrier = None;
    assert!(matches!(
        executor.proposal(&bad).await,
        Err(ExecutorError::InvalidParams(_))
    ));
    assert!(rpc.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resync_registers_unsold_contracts() {
    let rpc = MockRpcClient::new(|method, _, _| match method {
        Method::Portfolio => ok(
            "portfolio",
            json!({"contracts": [
                {"contract_id": 11, "contract_type": "DIGITDIFF", "is_sold": 0},
                {"contract_id": 12, "contract_type": "ACCU", "is_sold": 0},
                {"contract_id": 13, "contract_type": "DIGITDIFF", "is_sold": 1},
            ]}),
        ),
        other => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc);

    assert_eq!(
        executor.resync_open_contracts().await.unwrap(),
        Reconciled { added: 2, released: 0 }
    );
    assert_eq!(
        executor.resync_open_contracts().await.unwrap(),
        Reconciled::default()
    );
    assert_eq!(executor.open_contracts().total(), 2);
    assert!(!executor.open_contracts().contains(&ContractId::new("13")));
}

#[tokio::test(start_paused = true)]
async fn test_resync_frees_quota_of_timed_out_contract() {
    let rpc = MockRpcClient::new(|method, _, i| match method {
        Method::Buy => bought(&format!("C{i}")),
        Method::ProposalOpenContract => open_state(false, 0.0),
        Method::Portfolio => ok("portfolio", json!({"contracts": []})),
        other => panic!("unexpected {other}"),
    });
    let executor = OrderExecutor::new(
        rpc.clone(),
        ExecutorConfig {
            max_open_per_kind: 1,
            ..ExecutorConfig::default()
        },
    );

    let first = executor.buy(&params()).await.unwrap();
    let err = executor
        .poll_until_settled(&first.contract_id, Duration::from_secs(3))
        .await
        .unwrap_err();
    assert_eq!(err, ExecutorError::SettleTimeout(ContractId::new("C0")));
    assert!(matches!(
        executor.buy(&params()).await,
        Err(ExecutorError::QuotaExceeded { open: 1, limit: 1, .. })
    ));

    let outcome = executor.resync_open_contracts().await.unwrap();
    assert_eq!(outcome, Reconciled { added: 0, released: 1 });
    assert!(executor.open_contracts().is_empty());

    let second = executor.buy(&params()).await.unwrap();
    assert_eq!(second.contract_id, ContractId::new("C1"));
}

#[tokio::test(start_paused = true)]
async fn test_ticks_history_returns_prices() {
    let rpc = MockRpcClient::new(|method, request, _| match method {
        Method::TicksHistory => {
            assert_eq!(request["ticks_history"], "R_100");
            ok("history", json!({"prices": [100.12, 100.17], "times": [1, 2]}))
        }
        other => panic!("unexpected {other}"),
    });
    let executor = new_executor(rpc);

    let prices = executor.ticks_history("R_100", 2).await.unwrap();
    assert_eq!(prices, vec![dec!(100.12), dec!(100.17)]);
}
