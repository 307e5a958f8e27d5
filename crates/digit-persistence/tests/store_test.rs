//! REST store and journal fallback against a local HTTP server.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use digit_core::Operation;
use digit_persistence::{
    JournaledStore, JsonlJournal, OperationSink, PersistenceConfig, PersistenceError,
    RestOperationStore,
};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
struct TableServer {
    status: StatusCode,
    received: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn insert(
    State(server): State<TableServer>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    server.received.lock().push((headers, body));
    server.status
}

async fn start(status: StatusCode) -> (SocketAddr, TableServer) {
    let server = TableServer {
        status,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/rest/v1/operation_logs", post(insert))
        .with_state(server.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, server)
}

fn operation() -> Operation {
    Operation::from_settlement(
        "digit-bot",
        dec!(1.0),
        dec!(0.95),
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    )
}

fn store(addr: SocketAddr) -> RestOperationStore {
    RestOperationStore::new(
        &format!("http://{addr}/"),
        "secret",
        &PersistenceConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_insert_posts_record_with_key_headers() {
    let (addr, server) = start(StatusCode::CREATED).await;
    let store = store(addr);
    assert_eq!(
        store.endpoint(),
        format!("http://{addr}/rest/v1/operation_logs")
    );

    store.persist(&operation()).await.unwrap();

    let received = server.received.lock();
    assert_eq!(received.len(), 1);
    let (headers, body) = &received[0];
    assert_eq!(headers["apikey"], "secret");
    assert_eq!(headers["authorization"], "Bearer secret");
    assert_eq!(body["bot_name"], "digit-bot");
    assert_eq!(body["operation_result"], "WIN");
    assert_eq!(body["profit"], serde_json::json!(0.95));
    assert_eq!(body["timestamp"], "2024-06-01T12:00:00Z");
}

#[tokio::test]
async fn test_rejected_insert_reports_status() {
    let (addr, _server) = start(StatusCode::UNAUTHORIZED).await;
    let err = store(addr).persist(&operation()).await.unwrap_err();
    assert!(matches!(err, PersistenceError::Rejected { status: 401, .. }));
}

#[tokio::test]
async fn test_failed_insert_is_journaled() {
    let (addr, server) = start(StatusCode::INTERNAL_SERVER_ERROR).await;
    let dir = tempfile::tempdir().unwrap();
    let journaled = JournaledStore::new(
        Arc::new(store(addr)),
        JsonlJournal::new(dir.path()).unwrap(),
    );

    journaled.persist(&operation()).await.unwrap();

    assert_eq!(server.received.lock().len(), 1);
    let stats = journaled.stats();
    assert_eq!((stats.inserted, stats.journaled, stats.lost), (0, 1, 0));

    let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    let records = journaled.journal().read_day(day).unwrap();
    assert_eq!(records, vec![operation()]);
}

#[tokio::test]
async fn test_successful_insert_skips_journal() {
    let (addr, _server) = start(StatusCode::CREATED).await;
    let dir = tempfile::tempdir().unwrap();
    let journaled = JournaledStore::new(
        Arc::new(store(addr)),
        JsonlJournal::new(dir.path()).unwrap(),
    );

    journaled.persist(&operation()).await.unwrap();

    assert_eq!(journaled.stats().inserted, 1);
    let day = chrono::NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    assert!(journaled.journal().read_day(day).unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_store_is_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let unreachable = RestOperationStore::new(
        "http://127.0.0.1:1",
        "secret",
        &PersistenceConfig {
            timeout_ms: 500,
            ..Default::default()
        },
    )
    .unwrap();
    let journaled = JournaledStore::new(
        Arc::new(unreachable),
        JsonlJournal::new(dir.path()).unwrap(),
    );

    journaled.persist(&operation()).await.unwrap();
    assert_eq!(journaled.stats().journaled, 1);
}
