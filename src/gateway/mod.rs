//! Live connection gateway: WebSocket endpoint streaming task events.
//!
//! `GET /ws/tasks/{task_id}` upgrades to a WebSocket bound to that task. The
//! gateway sends a `connection` envelope, then a `task_update` for every
//! event published for the task while the connection is open. It never talks
//! to workers; everything arrives through the [`EventBus`].

pub mod connection;
pub mod protocol;

pub use connection::{ConnState, Connection};
pub use protocol::{ClientMessage, ServerMessage};

use crate::broadcast::{DEFAULT_SUBSCRIBER_CAPACITY, EventBus};
use crate::error::Result;
use crate::model::{Event, TaskId};
use crate::telemetry::metrics;
use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Close connections with no traffic in either direction for this long.
    pub idle_timeout: Duration,
    /// Per-connection event buffer.
    pub channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            channel_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    bus: Arc<EventBus>,
    config: GatewayConfig,
    shutdown: Arc<watch::Sender<bool>>,
    open: Arc<AtomicUsize>,
}

/// The gateway server. Cloning shares the same shutdown signal.
#[derive(Clone)]
pub struct Gateway {
    bus: Arc<EventBus>,
    config: GatewayConfig,
    shutdown: Arc<watch::Sender<bool>>,
    open: Arc<AtomicUsize>,
}

impl Gateway {
    pub fn new(bus: Arc<EventBus>, config: GatewayConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            config,
            shutdown: Arc::new(shutdown),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build the Axum router with the WebSocket and health routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            open: Arc::clone(&self.open),
        };

        Router::new()
            .route("/ws/tasks/{task_id}", get(ws_handler))
            .route("/ws/tasks/{task_id}/", get(ws_handler))
            .route("/health", get(health))
            .with_state(state)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Close every connection and stop accepting new ones.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serve on `listener` until [`Gateway::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "gateway listening");

        let mut stop = self.shutdown.subscribe();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while !*stop.borrow_and_update() {
                    if stop.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;

        info!("gateway stopped");
        Ok(())
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "taskcast-gateway",
        "connections": state.open.load(Ordering::SeqCst),
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let Ok(task_id) = task_id.parse::<TaskId>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Invalid task ID"})),
        )
            .into_response();
    };
    debug!(%task_id, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, task_id, state))
}

enum CloseReason {
    Client,
    Idle,
    Shutdown,
    SendFailed,
}

async fn send_json(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize server message");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, task_id: TaskId, state: AppState) {
    let mut shutdown = state.shutdown.subscribe();
    let (mut conn, mut events) = Connection::new(Arc::clone(&state.bus), state.config.channel_capacity);
    conn.open(task_id).await;
    state.open.fetch_add(1, Ordering::SeqCst);
    metrics::gateway_connections().add(1, &[]);
    info!(%task_id, "WebSocket client connected");

    let reason = if *shutdown.borrow() {
        CloseReason::Shutdown
    } else if !send_json(&mut socket, &ServerMessage::connection(task_id)).await {
        CloseReason::SendFailed
    } else {
        run_open(
            &mut socket,
            &mut conn,
            &mut events,
            &mut shutdown,
            state.config.idle_timeout,
        )
        .await
    };

    // Open -> Closing: drop fan-out registrations before anything else.
    conn.close().await;
    drop(events);

    let frame = match reason {
        CloseReason::Idle => Some((close_code::NORMAL, "idle timeout")),
        CloseReason::Shutdown => Some((close_code::AWAY, "server shutting down")),
        CloseReason::Client | CloseReason::SendFailed => None,
    };
    if let Some((code, text)) = frame {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: text.to_string().into(),
            })))
            .await;
    }

    state.open.fetch_sub(1, Ordering::SeqCst);
    metrics::gateway_connections().add(-1, &[]);
    info!(%task_id, "WebSocket connection closed");
}

async fn run_open(
    socket: &mut WebSocket,
    conn: &mut Connection,
    events: &mut mpsc::Receiver<Event>,
    shutdown: &mut watch::Receiver<bool>,
    idle: Duration,
) -> CloseReason {
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return CloseReason::Shutdown;
                }
            }

            _ = tokio::time::sleep_until(deadline) => {
                debug!("closing idle WebSocket connection");
                return CloseReason::Idle;
            }

            // Forward events for bound tasks to this client
            Some(event) = events.recv() => {
                if !conn.accepts(&event) {
                    continue;
                }
                deadline = Instant::now() + idle;
                if !send_json(socket, &ServerMessage::from(event)).await {
                    debug!("Client disconnected during send");
                    return CloseReason::SendFailed;
                }
            }

            // Receive messages from client
            result = socket.recv() => {
                deadline = Instant::now() + idle;
                match result {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&text, conn).await {
                            if !send_json(socket, &reply).await {
                                return CloseReason::SendFailed;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return CloseReason::SendFailed;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket client disconnected");
                        return CloseReason::Client;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return CloseReason::Client;
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_message(text: &str, conn: &mut Connection) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping { timestamp }) => Some(ServerMessage::Pong { timestamp }),
        Ok(ClientMessage::Subscribe { task_id }) => {
            if conn.subscribe(task_id).await {
                debug!(%task_id, "client subscribed");
            }
            Some(ServerMessage::Subscribed { task_id })
        }
        Ok(ClientMessage::Unsubscribe { task_id }) => {
            conn.unsubscribe(task_id).await;
            Some(ServerMessage::Unsubscribed { task_id })
        }
        Err(e) => {
            debug!(error = %e, text = text, "Unrecognized WS message from client");
            Some(ServerMessage::Error {
                message: "unrecognized message".to_string(),
            })
        }
    }
}
