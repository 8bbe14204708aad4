//! The capture server.
//!
//! Each WebSocket client gets its own CLI on a pseudo-terminal. Terminal
//! bytes flow to the client verbatim and through a [`CommandParser`];
//! every completed command is given canonical output and published on the
//! command channel. Tutor frames from the [`TutorBridge`] are interleaved
//! with the terminal bytes on the same socket.
//!
//! # Endpoints
//!
//! - `GET /api/health` - Liveness, session id and lesson database
//! - `GET /ws` - Terminal and tutor WebSocket

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use prism_capture::{
    CapturedCommand, CommandParser, ParserEvent, PromptPattern, PtyEvent, PtyOptions, PtySession,
    ResultFormatter,
};
use prism_store::CommandPublisher;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::bridge::{ClientFrame, MessageKind, OutboundFrame, TutorBridge};
use crate::config::Config;
use crate::error::{PrismError, Result};

/// Interval between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

// ============================================================================
// Application State
// ============================================================================

/// Shared state for the capture server.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Session stamped on every captured command.
    pub session_id: String,
    /// Lesson database the CLI is pointed at.
    pub database: u8,
    /// Link to the evaluator for tutor frames and client requests.
    pub bridge: TutorBridge,
    /// Where completed commands go.
    pub publisher: CommandPublisher,
    /// Canonical output for completed commands.
    pub formatter: ResultFormatter,
}

impl AppState {
    /// Creates state whose formatter follows `config`.
    pub fn new(
        config: Config,
        session_id: impl Into<String>,
        database: u8,
        bridge: TutorBridge,
        publisher: CommandPublisher,
    ) -> Self {
        let formatter = ResultFormatter::new(
            config.cli.program.clone(),
            config.redis.host.clone(),
            config.redis.port,
            config.formatter_timeout(),
        );
        Self {
            config,
            session_id: session_id.into(),
            database,
            bridge,
            publisher,
            formatter,
        }
    }

    fn pty_options(&self) -> PtyOptions {
        PtyOptions::new(self.config.cli.program.clone())
            .with_args(self.config.cli_args(self.database))
            .with_size(self.config.cli.cols, self.config.cli.rows)
    }
}

/// Response body for `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `ok` while the server runs.
    pub status: String,
    /// Session this server captures for.
    pub session_id: String,
    /// Lesson database.
    pub database: u8,
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the router with the health endpoint and the WebSocket.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

/// Binds the configured address and serves until the task is aborted.
pub async fn serve(state: AppState) -> Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        PrismError::config_validation(
            format!("failed to bind to {addr}: {e}"),
            "Pick a free port with server.port in prism.json",
        )
    })?;
    let local: SocketAddr = listener.local_addr()?;
    info!(addr = %local, "Capture server listening");

    axum::serve(listener, create_router(state))
        .await
        .map_err(|e| PrismError::transport(format!("server stopped: {e}")))
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        session_id: state.session_id.clone(),
        database: state.database,
    })
}

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles one client for the lifetime of its socket.
///
/// - Spawns the CLI on a pseudo-terminal sized from config
/// - Forwards PTY output to the client as binary frames and into the parser
/// - Treats JSON text frames as control frames, everything else as keystrokes
/// - Sends heartbeat pings every 30 seconds, closing after 3 missed pongs
/// - Drops malformed control frames instead of typing them
/// - Closes when a newer client takes over the bridge
/// - Kills the CLI and detaches the bridge on the way out
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let prompt = match PromptPattern::new(&state.config.redis.host, state.config.redis.port) {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!("Failed to build prompt pattern: {}", e);
            return;
        }
    };

    let (pty, mut pty_events) = match PtySession::spawn(&state.pty_options()) {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!("Failed to start terminal: {}", e);
            let frame = OutboundFrame::TutorMessage {
                message: format!("❌ {e}"),
                message_type: MessageKind::Error,
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = sender.send(Message::Text(json)).await;
            }
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let mut parser = CommandParser::new(prompt, state.config.max_parser_buffer_bytes);
    let completed_tx = spawn_capture_worker(&state);

    let (tutor_tx, mut tutor_rx) = mpsc::unbounded_channel();
    let attachment = state.bridge.set_sender(tutor_tx).await;

    info!(session_id = %state.session_id, database = state.database, "Client attached");

    let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientFrame::parse(&text) {
                            Some(Ok(frame)) => handle_client_frame(&state, &pty, frame).await,
                            Some(Err(e)) => warn!("Dropping malformed control frame: {}", e),
                            None => {
                                if pty.write(text.as_bytes()).await.is_err() {
                                    warn!("Terminal closed while writing input");
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if pty.write(&data).await.is_err() {
                            warn!("Terminal closed while writing input");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs = 0;
                        debug!("Received pong from client");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!("Failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }

            event = pty_events.recv() => {
                match event {
                    Some(PtyEvent::Data(bytes)) => {
                        for parsed in parser.feed_bytes(&bytes) {
                            match parsed {
                                ParserEvent::Captured(command) => {
                                    debug!(command = %command, "Command submitted");
                                }
                                ParserEvent::Completed { command, output, database } => {
                                    let _ = completed_tx.send((command, output, database));
                                }
                            }
                        }
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            debug!("Failed to send terminal output, client disconnected");
                            break;
                        }
                    }
                    Some(PtyEvent::Exit(code)) => {
                        info!(exit_code = code, "Terminal exited, closing client");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        debug!("Terminal output ended");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            frame = tutor_rx.recv() => {
                let Some(json) = frame else {
                    info!("Another client took over this session, closing");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    debug!("Failed to send tutor frame, client disconnected");
                    break;
                }
            }

            _ = heartbeat_interval.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    warn!("Client missed {} pongs, disconnecting", MAX_MISSED_PONGS);
                    break;
                }
                missed_pongs += 1;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("Failed to send ping, client disconnected");
                    break;
                }
            }
        }
    }

    pty.kill().await;
    state.bridge.detach(attachment).await;
    info!(session_id = %state.session_id, "Client detached");
}

async fn handle_client_frame(state: &AppState, pty: &PtySession, frame: ClientFrame) {
    if let ClientFrame::Resize { cols, rows } = frame {
        if let Err(e) = pty.resize(cols, rows).await {
            debug!("{}", e);
        }
        return;
    }
    if let Some(request) = frame.into_request() {
        if !state.bridge.dispatch(request).await {
            debug!("No handler for client request");
        }
    }
}

/// Starts the task that turns completed commands into published events.
///
/// Commands are handled one at a time so events keep terminal order; the
/// read loop never waits on a canonical query.
fn spawn_capture_worker(state: &AppState) -> mpsc::UnboundedSender<(String, String, u8)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, String, u8)>();
    let formatter = state.formatter.clone();
    let publisher = state.publisher.clone();
    let session_id = state.session_id.clone();

    tokio::spawn(async move {
        while let Some((command, output, database)) = rx.recv().await {
            let csv = formatter.canonical_output(&command, &output, database).await;
            let captured = CapturedCommand::new(command, output, csv, session_id.clone());
            publisher.emit(&captured).await;
        }
    });

    tx
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use prism_store::LocalChannel;
    use tower::util::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        let publisher = CommandPublisher::new(Arc::new(LocalChannel::new()), "test");
        AppState::new(Config::default(), "session-1", 4, TutorBridge::new(), publisher)
    }

    #[tokio::test]
    async fn test_health_reports_session() {
        let router = create_router(test_state());

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.session_id, "session-1");
        assert_eq!(health.database, 4);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let router = create_router(test_state());

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/ws")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let router = create_router(test_state());

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/api/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_pty_options_follow_config() {
        let state = test_state();
        let options = state.pty_options();
        assert_eq!(options.program, "redis-cli");
        assert_eq!(
            options.args,
            vec!["-h", "127.0.0.1", "-p", "6379", "-n", "4"]
        );
        assert_eq!((options.cols, options.rows), (160, 40));
    }

    #[tokio::test]
    async fn test_capture_worker_publishes_in_order() {
        let channel = Arc::new(LocalChannel::new());
        let mut stream =
            prism_store::CommandStream::subscribe(channel.as_ref(), "test", "session-1")
                .await
                .unwrap();
        let transport: Arc<dyn prism_store::CommandChannel> = Arc::clone(&channel) as _;
        let publisher = CommandPublisher::new(transport, "test");
        let state = AppState::new(Config::default(), "session-1", 4, TutorBridge::new(), publisher);

        let tx = spawn_capture_worker(&state);
        tx.send(("SET a 1".to_string(), "OK".to_string(), 4)).unwrap();
        tx.send(("LPUSH q x".to_string(), "(integer) 1".to_string(), 4))
            .unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.command, "SET a 1");
        assert_eq!(first.csv_output, "OK");
        assert_eq!(first.session_id, "session-1");
        let second = stream.next().await.unwrap();
        assert_eq!(second.csv_output, "1");
    }
}
