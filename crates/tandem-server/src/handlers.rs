//! Connection handlers for Tandem server.
//!
//! This module handles the connection lifecycle and frame processing.

use crate::config::Config;
use crate::feedback::{FeedbackRecord, FeedbackWriter, JsonlFeedbackSink};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    ChannelRegistry, ConnectionId, ConnectionRegistry, EngineConfig, EventRouter, PairingEngine,
    PairingError, RelayEvent,
};
use tandem_protocol::{
    codec, ClientFrame, Encoded, Encoding, ErrorCode, LeaveReason, ProtocolError, ServerFrame,
};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ChannelRegistry>,
    /// Waiting queue and pair table.
    pub engine: Arc<PairingEngine>,
    /// Relays chat events between partners.
    pub router: EventRouter,
    /// Background feedback writer, when feedback is enabled.
    pub feedback: Option<FeedbackWriter>,
    /// Server configuration.
    pub config: Config,
    /// Connection slots in use, including upgrades still in flight.
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    ///
    /// Must be called inside a Tokio runtime when feedback is enabled.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let engine = Arc::new(PairingEngine::with_config(
            registry.clone(),
            EngineConfig {
                max_name_chars: config.limits.max_name_chars,
            },
        ));
        let router = EventRouter::new(engine.clone());

        let feedback = config.feedback.enabled.then(|| {
            let path = config.feedback_path();
            info!("Feedback is appended to {}", path.display());
            FeedbackWriter::spawn(Arc::new(JsonlFeedbackSink::new(path)))
        });

        Self {
            registry,
            engine,
            router,
            feedback,
            config,
            connections: AtomicUsize::new(0),
        }
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    /// Reserve a slot unless `limits.max_connections` are taken.
    fn try_reserve(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .ok()
            .map(|_| Self {
                state: state.clone(),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if state.feedback.is_some() {
        app = app.route("/api/feedback", post(feedback_handler));
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Tandem server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config));
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Tandem server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online": state.registry.live_count(),
        "waiting": stats.waiting,
        "paired": stats.paired,
    }))
}

/// Feedback submission handler.
async fn feedback_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Response {
    let Value::Object(payload) = payload else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Feedback must be a JSON object" })),
        )
            .into_response();
    };

    let record = FeedbackRecord::new(payload);
    let received_at = record.received_at;

    let queued = state
        .feedback
        .as_ref()
        .map(|writer| writer.submit(record))
        .unwrap_or(false);
    if queued {
        metrics::record_feedback();
    } else {
        warn!("Feedback writer unavailable, dropping submission");
        metrics::record_error("feedback");
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "received", "received_at": received_at })),
    )
        .into_response()
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    format: Encoding,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(slot) = ConnectionSlot::try_reserve(&state) else {
        warn!(
            live = state.registry.live_count(),
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    // A failed upgrade drops the callback, and the slot with it
    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.format, slot))
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    encoding: Encoding,
    _slot: ConnectionSlot,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut outbox = state.registry.register(connection_id);

    debug!(connection = %connection_id, ?encoding, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat_interval = Duration::from_millis(state.config.heartbeat.interval_ms.max(1));
    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    let welcome = ServerFrame::welcome(
        connection_id.to_string(),
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
        state.registry.live_count() as u64,
    );
    if send_frame(&mut sender, encoding, &welcome).await.is_err() {
        error!(connection = %connection_id, "Failed to send welcome frame");
        disconnect(&state, &connection_id);
        return;
    }
    state.registry.broadcast_online_count();

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Frames queued by the engine, the router or a broadcast
            Some(frame) = outbox.recv() => {
                if send_frame(&mut sender, encoding, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                let replies = match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = std::time::Instant::now();
                        let replies = handle_text(&state, connection_id, &text);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        replies
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = std::time::Instant::now();
                        let replies = handle_binary(&state, connection_id, &mut read_buffer, &data);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                        replies
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                };

                let mut failed = false;
                for reply in &replies {
                    if send_frame(&mut sender, encoding, reply).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    disconnect(&state, &connection_id);
    let _ = sender.close().await;
}

/// Tear down pairing state, then drop the connection from the registry.
fn disconnect(state: &AppState, connection_id: &ConnectionId) {
    let outcome = state
        .engine
        .teardown(connection_id, LeaveReason::Disconnected);
    metrics::record_teardown(&outcome, LeaveReason::Disconnected);
    metrics::set_engine_stats(&state.engine.stats());

    state.registry.unregister(connection_id);
    state.registry.broadcast_online_count();

    debug!(connection = %connection_id, ?outcome, "WebSocket disconnected");
}

/// Handle a JSON text message.
fn handle_text(state: &AppState, connection_id: ConnectionId, text: &str) -> Vec<ServerFrame> {
    metrics::record_frame(text.len(), "inbound");

    if text.len() > state.config.limits.max_message_size {
        return vec![too_large(state, connection_id, text.len())];
    }

    match codec::decode_json::<ClientFrame>(text) {
        Ok(frame) => handle_frame(state, connection_id, frame).into_iter().collect(),
        Err(e) => vec![invalid_frame(connection_id, &e)],
    }
}

/// Frames a single read buffer may hold before it is discarded.
const READ_BUFFER_FRAMES: usize = 64;

/// Handle a binary message carrying length-prefixed MessagePack frames.
///
/// Each frame is checked against `limits.max_message_size` by its length
/// prefix before it is decoded; a message may carry several frames.
fn handle_binary(
    state: &AppState,
    connection_id: ConnectionId,
    read_buffer: &mut BytesMut,
    data: &[u8],
) -> Vec<ServerFrame> {
    metrics::record_frame(data.len(), "inbound");

    let max_frame = state.config.limits.max_message_size;
    let buffer_limit = max_frame
        .saturating_add(codec::LENGTH_PREFIX_SIZE)
        .saturating_mul(READ_BUFFER_FRAMES);
    if read_buffer.len() + data.len() > buffer_limit {
        let size = read_buffer.len() + data.len();
        read_buffer.clear();
        return vec![too_large(state, connection_id, size)];
    }
    read_buffer.extend_from_slice(data);

    let mut replies = Vec::new();
    loop {
        match codec::peek_length(read_buffer) {
            None => break,
            Some(length) if length > max_frame => {
                // The rest of the buffer cannot be framed; resynchronise
                read_buffer.clear();
                replies.push(too_large(state, connection_id, length));
                break;
            }
            Some(_) => {}
        }

        match codec::decode_from::<ClientFrame>(read_buffer) {
            Ok(Some(frame)) => replies.extend(handle_frame(state, connection_id, frame)),
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                read_buffer.clear();
                replies.push(invalid_frame(connection_id, &e));
                break;
            }
            Err(e) => replies.push(invalid_frame(connection_id, &e)),
        }
    }
    replies
}

fn too_large(state: &AppState, connection_id: ConnectionId, size: usize) -> ServerFrame {
    debug!(connection = %connection_id, size, "Frame too large");
    metrics::record_error("frame_too_large");
    ServerFrame::error(
        ErrorCode::FrameTooLarge,
        format!(
            "Frame of {} bytes exceeds limit of {} bytes",
            size, state.config.limits.max_message_size
        ),
    )
}

fn invalid_frame(connection_id: ConnectionId, error: &ProtocolError) -> ServerFrame {
    debug!(connection = %connection_id, error = %error, "Invalid frame");
    metrics::record_error("invalid_frame");
    ServerFrame::error(ErrorCode::InvalidFrame, error.to_string())
}

/// Handle a decoded frame, returning the direct reply if there is one.
///
/// Everything else a frame causes is delivered through the registry.
fn handle_frame(
    state: &AppState,
    connection_id: ConnectionId,
    frame: ClientFrame,
) -> Option<ServerFrame> {
    trace!(connection = %connection_id, kind = frame.kind(), "Frame received");

    match frame {
        ClientFrame::Join { name } => {
            let result = state.engine.request_pairing(connection_id, name.as_deref());
            metrics::set_engine_stats(&state.engine.stats());
            match result {
                Ok(outcome) => {
                    metrics::record_join(&outcome);
                    None
                }
                Err(e) => {
                    debug!(connection = %connection_id, error = %e, "Join rejected");
                    let code = match e {
                        PairingError::AlreadyWaiting(_) => ErrorCode::AlreadyWaiting,
                        PairingError::AlreadyPaired(_) => ErrorCode::AlreadyPaired,
                    };
                    Some(ServerFrame::error(code, e.to_string()))
                }
            }
        }

        ClientFrame::Send { text, reply_to } => {
            if text.trim().is_empty() {
                trace!(connection = %connection_id, "Dropping blank message");
                return None;
            }
            relay(state, connection_id, RelayEvent::Message { text, reply_to })
        }

        ClientFrame::TypingStart => relay(state, connection_id, RelayEvent::TypingStart),

        ClientFrame::TypingStop => relay(state, connection_id, RelayEvent::TypingStop),

        ClientFrame::Leave => {
            let outcome = state.engine.teardown(&connection_id, LeaveReason::Ended);
            metrics::record_teardown(&outcome, LeaveReason::Ended);
            metrics::set_engine_stats(&state.engine.stats());
            debug!(connection = %connection_id, ?outcome, "Leave");
            None
        }

        ClientFrame::Ping { timestamp } => Some(ServerFrame::pong(timestamp)),
    }
}

fn relay(state: &AppState, connection_id: ConnectionId, event: RelayEvent) -> Option<ServerFrame> {
    let outcome = state.router.route(&connection_id, event);
    metrics::record_route(&outcome);
    None
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, encoding: Encoding, frame: &ServerFrame) -> Result<()> {
    let message = match encoding.encode(frame)? {
        Encoded::Text(text) => {
            metrics::record_frame(text.len(), "outbound");
            Message::Text(text)
        }
        Encoded::Binary(data) => {
            metrics::record_frame(data.len(), "outbound");
            Message::Binary(data.to_vec())
        }
    };
    sender.send(message).await?;
    Ok(())
}
