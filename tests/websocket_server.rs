//! Streaming over a real WebSocket against the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use livesync::config::LivesyncConfig;
use livesync::http_server::{AppState, HttpServer};
use livesync::memory::MemoryDatabase;
use livesync::realtime::{ExperimentMsg, User};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);

struct Server {
    addr: SocketAddr,
    db: Arc<MemoryDatabase>,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

async fn start_server() -> Server {
    let mut config = LivesyncConfig::default();
    config.users = vec![User {
        id: 1,
        username: "admin".to_string(),
        admin: true,
    }];
    let db = Arc::new(MemoryDatabase::new());
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::from_config(&config, Arc::clone(&db), shutdown.clone()));

    {
        let supervisor = state.supervisor.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { supervisor.run(token).await });
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config.http.clone(), Arc::clone(&state));
    tokio::spawn(async move { server.serve(listener).await });

    Server {
        addr,
        db,
        state,
        shutdown,
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

async fn next_close(ws: &mut Client) -> u16 {
    loop {
        let msg = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for close")
            .expect("socket ended")
            .unwrap();
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

fn experiment(id: i64, project_id: i64) -> ExperimentMsg {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("exp-{}", id),
        "project_id": project_id,
        "workspace_id": 1,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_stream_over_websocket() {
    let server = start_server().await;
    server.db.experiments.seed([experiment(1, 10), experiment(2, 10)]);

    let url = format!("ws://{}/stream?token=admin", server.addr);
    let (mut ws, _) = connect_async(url).await.unwrap();

    let startup = json!({
        "sync_id": "s1",
        "known": {"experiments": "2,5"},
        "subscribe": {"experiments": {"project_ids": [10]}},
    });
    ws.send(Message::Text(startup.to_string())).await.unwrap();

    assert_eq!(next_json(&mut ws).await, json!({"sync_id": "s1", "complete": false}));
    assert_eq!(next_json(&mut ws).await, json!({"experiments_deleted": "5"}));
    assert_eq!(next_json(&mut ws).await["experiment"]["id"], 1);
    assert_eq!(next_json(&mut ws).await, json!({"sync_id": "s1", "complete": true}));

    server.db.experiments.upsert(experiment(3, 10));
    let frame = next_json(&mut ws).await;
    assert_eq!(frame["experiment"]["name"], "exp-3");
    assert!(frame["experiment"]["seq"].as_i64().unwrap() > 2);

    let metrics = http_get(server.addr, "/metrics").await;
    assert!(metrics.contains("\"startup_syncs\":1"), "{}", metrics);

    server.shutdown.cancel();
    assert_eq!(next_close(&mut ws).await, 1000);
}

#[tokio::test]
async fn test_malformed_startup_closes_with_code() {
    let server = start_server().await;
    let url = format!("ws://{}/stream?token=admin", server.addr);
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"sync_id": "x", "known": {"widgets": ""}}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_close(&mut ws).await, 1003);
    assert_eq!(server.state.supervisor.metrics().snapshot().protocol_errors, 1);
    server.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_token_rejected() {
    let server = start_server().await;
    let url = format!("ws://{}/stream?token=mallory", server.addr);
    match connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        other => panic!("expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }
    server.shutdown.cancel();
}

#[tokio::test]
async fn test_health_reports_streaming() {
    let server = start_server().await;
    tokio::time::timeout(WAIT, server.state.supervisor.current(&server.shutdown))
        .await
        .unwrap()
        .unwrap();

    let health = http_get(server.addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{}", health);
    assert!(health.contains("\"streaming\":true"));
    server.shutdown.cancel();
}
