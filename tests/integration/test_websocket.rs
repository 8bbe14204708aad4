//! Integration tests for the capture server over a real listener.
//!
//! Tests that need a working pseudo-terminal are ignored by default; run
//! them with `cargo test -- --ignored` on a machine that has one.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use prism_store::{CommandChannel, CommandPublisher, CommandStream, LocalChannel};
use prism_tutor::{create_router, AppState, Config, HealthResponse, OutboundFrame, TutorBridge};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const CHANNEL: &str = "prism:commands";
const SESSION: &str = "session-ws";

/// Helper to find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Helper type for WebSocket client
type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn app_state(config: Config, transport: Arc<dyn CommandChannel>) -> AppState {
    AppState::new(
        config,
        SESSION,
        4,
        TutorBridge::new(),
        CommandPublisher::new(transport, CHANNEL),
    )
}

/// Spawns the test server and returns its base address.
async fn spawn_test_server(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, handle)
}

async fn connect_client(addr: &str) -> WsClient {
    let (ws_stream, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next non-control message, answering pings on the way.
async fn next_message(client: &mut WsClient) -> Option<Message> {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")?
            .ok()?;
        match msg {
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) | Message::Frame(_) => {}
            other => return Some(other),
        }
    }
}

#[tokio::test]
async fn test_health_over_listener() {
    let (addr, handle) = spawn_test_server(app_state(
        Config::default(),
        Arc::new(LocalChannel::new()),
    ))
    .await;

    let mut stream = TcpStream::connect(&addr).await.expect("connect");
    let request = format!("GET /api/health HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .expect("write request");
    let mut raw = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut raw)
        .await
        .expect("read response");
    let raw = String::from_utf8(raw).expect("utf-8 response");

    assert!(raw.starts_with("HTTP/1.1 200"));
    let body = raw.split("\r\n\r\n").nth(1).expect("response body");
    let health: HealthResponse = serde_json::from_str(body).expect("health json");
    assert_eq!(health.status, "ok");
    assert_eq!(health.session_id, SESSION);
    assert_eq!(health.database, 4);

    handle.abort();
}

#[tokio::test]
async fn test_unstartable_cli_reports_error_and_closes() {
    let mut config = Config::default();
    config.cli.program = "/nonexistent/prism-test-cli".to_string();
    let (addr, handle) =
        spawn_test_server(app_state(config, Arc::new(LocalChannel::new()))).await;

    let mut client = connect_client(&addr).await;

    let Some(Message::Text(text)) = next_message(&mut client).await else {
        panic!("expected an error frame");
    };
    let frame: OutboundFrame = serde_json::from_str(&text).expect("tutor frame");
    let OutboundFrame::TutorMessage { message, .. } = frame else {
        panic!("expected a tutor message, got {frame:?}");
    };
    assert!(message.starts_with("❌ "));

    // Server closes after reporting
    match next_message(&mut client).await {
        None | Some(Message::Close(_)) => {}
        Some(other) => panic!("expected close, got {other:?}"),
    }

    handle.abort();
}

#[tokio::test]
#[ignore = "requires a pseudo-terminal"]
async fn test_terminal_bytes_round_trip() {
    let mut config = Config::default();
    config.cli.program = "cat".to_string();
    config.cli.args = Some(Vec::new());
    let (addr, handle) =
        spawn_test_server(app_state(config, Arc::new(LocalChannel::new()))).await;

    let mut client = connect_client(&addr).await;
    client
        .send(Message::Text("hello prism\r".to_string()))
        .await
        .expect("send keystrokes");

    let mut echoed = String::new();
    while !echoed.contains("hello prism") {
        match next_message(&mut client).await {
            Some(Message::Binary(bytes)) => echoed.push_str(&String::from_utf8_lossy(&bytes)),
            Some(_) => {}
            None => break,
        }
    }
    assert!(echoed.contains("hello prism"));

    client.close(None).await.expect("close");
    handle.abort();
}

#[tokio::test]
#[ignore = "requires a pseudo-terminal"]
async fn test_prompt_cycles_are_published() {
    let transport: Arc<dyn CommandChannel> = Arc::new(LocalChannel::new());
    let mut stream = CommandStream::subscribe(transport.as_ref(), CHANNEL, SESSION)
        .await
        .expect("subscribe");

    // A stand-in CLI: prints a prompt, reads one line, answers PONG
    let mut config = Config::default();
    config.cli.program = "sh".to_string();
    config.cli.args = Some(vec![
        "-c".to_string(),
        "printf '127.0.0.1:6379> '; read line; echo PONG; printf '127.0.0.1:6379> '; sleep 5"
            .to_string(),
    ]);
    config.formatter_timeout_ms = 200;
    let (addr, handle) = spawn_test_server(app_state(config, Arc::clone(&transport))).await;

    let mut client = connect_client(&addr).await;
    client
        .send(Message::Text("PING\r".to_string()))
        .await
        .expect("send keystrokes");

    let captured = timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("Timeout waiting for captured command")
        .expect("stream open");
    assert_eq!(captured.command, "PING");
    assert_eq!(captured.terminal_output, "PONG");
    assert_eq!(captured.session_id, SESSION);

    handle.abort();
}
