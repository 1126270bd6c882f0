//! Connection handlers for the Courier server.
//!
//! This module handles the connection lifecycle and frame processing.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{ConnectionId, Hub, Inbound, NotificationDraft, Receipt};
use courier_protocol::{codec, codes, Frame, ProtocolError, WireFormat, PROTOCOL_VERSION};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Close code sent when an inbound message exceeds the size limit.
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Shared server state.
pub struct AppState {
    /// Routing state.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::with_config(config.hub_config()),
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Reserve room for one more connection, if under the limit.
    fn try_acquire_slot(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let limit = self.config.limits.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;
        Some(ConnectionSlot {
            state: Arc::clone(self),
        })
    }
}

/// Holds one unit of the connection limit until dropped.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Removes the connection from the hub on every exit path.
struct SessionGuard {
    state: Arc<AppState>,
    connection_id: ConnectionId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(departure) = self.state.hub.disconnect(&self.connection_id) {
            debug!(
                connection = %self.connection_id,
                topics = departure.topics.len(),
                "Session cleaned up"
            );
        }
        metrics::record_hub_stats(self.state.hub.stats());
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let state = Arc::new(AppState::new(config));
    serve(listener, state, shutdown_signal()).await?;

    info!("Courier server stopped");
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
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connections,
        "users": stats.users,
    }))
}

/// Upgrade query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Wire format name, `json` or `msgpack`.
    pub format: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let format = match params.format.as_deref().map(str::parse::<WireFormat>) {
        None => WireFormat::default(),
        Some(Ok(format)) => format,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let Some(slot) = state.try_acquire_slot() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, format, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    format: WireFormat,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let mut mailbox = match state.hub.connect(connection_id.clone()) {
        Ok(mailbox) => mailbox,
        Err(e) => {
            error!(connection = %connection_id, error = %e, "Failed to register connection");
            return;
        }
    };
    let _session = SessionGuard {
        state: Arc::clone(&state),
        connection_id: connection_id.clone(),
    };

    debug!(connection = %connection_id, format = ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(connection_id.as_str(), PROTOCOL_VERSION.major, heartbeat);
    if let Err(e) = send_frame(&mut sender, format, &connected).await {
        error!(connection = %connection_id, error = %e, "Failed to send Connected frame");
        return;
    }

    let max_message_size = state.config.limits.max_message_size;
    let idle_timeout = state.config.idle_timeout();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    'session: loop {
        tokio::select! {
            biased;

            delivery = mailbox.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                if let Err(e) = send_frame(&mut sender, format, &delivery.to_frame()).await {
                    debug!(connection = %connection_id, error = %e, "Outbound send failed");
                    break;
                }
            }

            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                let msg = match msg {
                    Some(Ok(msg)) => msg,
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

                let size = match &msg {
                    Message::Text(text) => text.len(),
                    Message::Binary(data) => data.len(),
                    _ => 0,
                };
                if size > max_message_size {
                    close_too_large(&mut sender, &connection_id, size, max_message_size).await;
                    break;
                }

                let start = Instant::now();
                let mut replies = Vec::new();
                match msg {
                    Message::Text(text) => {
                        metrics::record_frame(size, "inbound");
                        replies.push(match codec::decode_json(&text) {
                            Ok(frame) => handle_frame(&state, &connection_id, frame),
                            Err(e) => Some(invalid_frame(&connection_id, &e)),
                        });
                    }
                    Message::Binary(data) => {
                        read_buffer.extend_from_slice(&data);
                        // A frame may span several messages; its declared
                        // length is checked as soon as the prefix arrives.
                        while let Some(frame_len) = codec::peek_frame_len(&read_buffer) {
                            if frame_len > max_message_size {
                                close_too_large(&mut sender, &connection_id, frame_len, max_message_size)
                                    .await;
                                break 'session;
                            }
                            match codec::decode_from(&mut read_buffer) {
                                Ok(Some(frame)) => {
                                    metrics::record_frame(frame_len, "inbound");
                                    replies.push(handle_frame(&state, &connection_id, frame));
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    read_buffer.clear();
                                    replies.push(Some(invalid_frame(&connection_id, &e)));
                                    break;
                                }
                            }
                        }
                    }
                    Message::Ping(data) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                }

                let mut failed = false;
                for reply in replies.into_iter().flatten() {
                    if let Err(e) = send_frame(&mut sender, format, &reply).await {
                        debug!(connection = %connection_id, error = %e, "Reply send failed");
                        failed = true;
                        break;
                    }
                }
                metrics::record_latency(start.elapsed().as_secs_f64());
                if failed {
                    break;
                }
            }

            () = &mut idle => {
                info!(
                    connection = %connection_id,
                    timeout_ms = idle_timeout.as_millis() as u64,
                    "Idle timeout, closing connection"
                );
                break;
            }
        }
    }

    debug!(connection = %connection_id, "WebSocket disconnected");
}

async fn close_too_large(
    sender: &mut SplitSink<WebSocket, Message>,
    connection_id: &ConnectionId,
    size: usize,
    limit: usize,
) {
    warn!(
        connection = %connection_id,
        size,
        limit,
        "Inbound frame too large, closing"
    );
    metrics::record_error("message_too_large");
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_MESSAGE_TOO_BIG,
            reason: "message too large".into(),
        })))
        .await;
}

fn invalid_frame(connection_id: &ConnectionId, e: &ProtocolError) -> Frame {
    debug!(connection = %connection_id, error = %e, "Invalid inbound frame");
    metrics::record_error("invalid_frame");
    Frame::error(0, codes::INVALID_FRAME, e.to_string())
}

/// Handle a decoded frame and return the reply for the sender, if any.
///
/// Routed messages never come back through here; they reach connections,
/// the sender included, via their mailboxes.
fn handle_frame(state: &AppState, connection_id: &ConnectionId, frame: Frame) -> Option<Frame> {
    match frame {
        Frame::Connect { version, token } => {
            debug!(
                connection = %connection_id,
                version,
                has_token = token.is_some(),
                "Connect frame"
            );
            if PROTOCOL_VERSION.accepts(version) {
                None
            } else {
                Some(Frame::error(
                    0,
                    codes::UNSUPPORTED_VERSION,
                    format!(
                        "Protocol version {} is not supported, server speaks {}",
                        version, PROTOCOL_VERSION
                    ),
                ))
            }
        }

        Frame::Subscribe { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Subscribe request");
            let reply = match state.hub.subscribe(connection_id, &topic) {
                Ok(_) => Frame::ack(id),
                Err(e) => {
                    warn!(connection = %connection_id, topic = %topic, error = %e, "Subscribe failed");
                    Frame::error(id, e.code(), e.to_string())
                }
            };
            metrics::record_hub_stats(state.hub.stats());
            Some(reply)
        }

        Frame::Unsubscribe { id, topic } => {
            debug!(connection = %connection_id, topic = %topic, "Unsubscribe request");
            Some(match state.hub.unsubscribe(connection_id, &topic) {
                Ok(_) => Frame::ack(id),
                Err(e) => Frame::error(id, e.code(), e.to_string()),
            })
        }

        Frame::Join { id, sender } => dispatch(state, connection_id, id, Inbound::Join { sender }),

        Frame::Send {
            id,
            sender,
            content,
        } => dispatch(state, connection_id, id, Inbound::Chat { sender, content }),

        Frame::Notify {
            id,
            title,
            message,
            severity,
            recipient,
        } => dispatch(
            state,
            connection_id,
            id,
            Inbound::Notification(NotificationDraft {
                title,
                message,
                severity,
                recipient,
            }),
        ),

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        other => {
            let frame_type = other.frame_type();
            warn!(connection = %connection_id, frame_type = frame_type.as_str(), "Unexpected frame type");
            Some(Frame::error(
                0,
                codes::INVALID_FRAME,
                format!("Frame type {} is not accepted from clients", frame_type.as_str()),
            ))
        }
    }
}

fn dispatch(
    state: &AppState,
    connection_id: &ConnectionId,
    request_id: Option<u64>,
    inbound: Inbound,
) -> Option<Frame> {
    match state.hub.dispatch(connection_id, inbound) {
        Ok(receipt) => {
            match receipt {
                Receipt::Joined(identification) => {
                    if let Some((_, report)) = identification.announcement {
                        metrics::record_delivery(report);
                        metrics::record_hub_stats(state.hub.stats());
                    }
                }
                Receipt::Chat { report, .. } | Receipt::Notification { report, .. } => {
                    metrics::record_delivery(report);
                }
            }
            request_id.map(Frame::ack)
        }
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Dispatch rejected");
            Some(Frame::error(request_id.unwrap_or(0), e.code(), e.to_string()))
        }
    }
}

fn encode_frame(format: WireFormat, frame: &Frame) -> Result<Message, ProtocolError> {
    Ok(match format {
        WireFormat::Json => Message::Text(codec::encode_json(frame)?),
        WireFormat::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
    })
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    frame: &Frame,
) -> Result<()> {
    let message = encode_frame(format, frame)?;
    let size = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(size, "outbound");
    sender.send(message).await?;
    Ok(())
}
