//! Mock broker WebSocket server for integration tests.
//!
//! Accepts connections, records every request frame and answers through a
//! test-supplied responder. Connections can be dropped on demand to exercise
//! reconnect paths.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// What the broker does with one request.
pub enum Reply {
    /// Send this frame.
    Json(Value),
    /// Never answer.
    Ignore,
    /// Close the connection.
    Close,
    /// Send this frame after a delay.
    Delayed(Duration, Value),
}

pub type Responder = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

const METHODS: [&str; 7] = [
    "authorize",
    "ping",
    "proposal_open_contract",
    "proposal",
    "buy",
    "portfolio",
    "ticks_history",
];

/// Method name of a request frame.
pub fn method_of(request: &Value) -> &'static str {
    METHODS
        .iter()
        .find(|m| request.get(**m).is_some())
        .copied()
        .unwrap_or("unknown")
}

/// Successful response echoing the request's `req_id`.
pub fn ok(request: &Value, msg_type: &str, payload: Value) -> Reply {
    let mut frame = json!({
        "req_id": request["req_id"].clone(),
        "msg_type": msg_type,
        "echo_req": request.clone(),
    });
    frame[msg_type] = payload;
    Reply::Json(frame)
}

/// Error response echoing the request's `req_id`.
pub fn error(request: &Value, code: &str, message: &str) -> Reply {
    Reply::Json(json!({
        "req_id": request["req_id"].clone(),
        "msg_type": method_of(request),
        "echo_req": request.clone(),
        "error": {"code": code, "message": message},
    }))
}

/// Answers `authorize` and `ping`; ignores everything else.
pub fn standard_reply(request: &Value) -> Reply {
    match method_of(request) {
        "authorize" => ok(request, "authorize", json!({"loginid": "VRTC0001", "currency": "USD"})),
        "ping" => ok(request, "ping", json!("pong")),
        _ => Reply::Ignore,
    }
}

/// A mock broker for testing.
pub struct MockBroker {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    drop_tx: broadcast::Sender<()>,
    messages: Arc<Mutex<Vec<Value>>>,
    connections: Arc<Mutex<u32>>,
}

impl MockBroker {
    /// Start a broker answering with [`standard_reply`].
    pub async fn start_standard() -> Self {
        Self::start(standard_reply).await
    }

    /// Start a broker on an available port.
    pub async fn start<F>(responder: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let responder: Responder = Arc::new(responder);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let messages: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let connections: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (drop_tx, _) = broadcast::channel::<()>(4);

        let messages_clone = messages.clone();
        let connections_clone = connections.clone();
        let drop_clone = drop_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            responder.clone(),
                            messages_clone.clone(),
                            connections_clone.clone(),
                            drop_clone.subscribe(),
                        ));
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            drop_tx,
            messages,
            connections,
        }
    }

    /// The broker's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of connections accepted.
    pub async fn connection_count(&self) -> u32 {
        *self.connections.lock().await
    }

    /// Every request frame received, in arrival order.
    pub async fn received(&self) -> Vec<Value> {
        self.messages.lock().await.clone()
    }

    /// Request frames for one method.
    pub async fn received_for(&self, method: &str) -> Vec<Value> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| method_of(m) == method)
            .cloned()
            .collect()
    }

    /// Close every open connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.drop_tx.send(());
    }

    /// Stop accepting connections.
    pub async fn shutdown(self) {
        self.drop_connections();
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    responder: Responder,
    messages: Arc<Mutex<Vec<Value>>>,
    connections: Arc<Mutex<u32>>,
    mut drop_rx: broadcast::Receiver<()>,
) {
    {
        let mut count = connections.lock().await;
        *count += 1;
    }

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // Replies go through a channel so delayed answers never block reads.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if write.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = drop_rx.recv() => {
                let _ = out_tx.send(Message::Close(None)).await;
                break;
            }
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                messages.lock().await.push(request.clone());

                match responder(&request) {
                    Reply::Json(frame) => {
                        let _ = out_tx.send(Message::Text(frame.to_string())).await;
                    }
                    Reply::Ignore => {}
                    Reply::Close => {
                        let _ = out_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Reply::Delayed(delay, frame) => {
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = out_tx.send(Message::Text(frame.to_string())).await;
                        });
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            _ => {}
        }
    }

    drop(out_tx);
    let _ = writer.await;
}
