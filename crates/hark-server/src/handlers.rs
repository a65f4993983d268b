//! Connection handlers for Hark server.
//!
//! This module drives each WebSocket through the hub: it decodes inbound
//! frames into client events, writes the connection's outbound queue to the
//! socket and keeps the heartbeat.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hark_core::{Hub, Outcome, Session};
use hark_protocol::{codec, ClientEvent, Encoding, ProtocolError, ServerEvent, WireFrame};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

type WsSink = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    /// Connections accepted or mid-upgrade.
    slots: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let store = Arc::new(config.user_store());
        Self {
            hub: Hub::with_config(store, config.hub_config()),
            config,
            slots: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// A reserved connection slot, released on drop.
///
/// Reserved before the upgrade. A failed upgrade drops the callback that
/// owns the slot, which releases it.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(slots: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .ok()
            .map(|_| Self(Arc::clone(slots)))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config));
    let config = &state.config;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Hark server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let app = build_router(Arc::clone(&state));
    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connections,
        "online": stats.online_users,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let limits = &state.config.limits;
    let Some(slot) = ConnectionSlot::acquire(&state.slots, limits.max_connections) else {
        warn!(
            max_connections = limits.max_connections,
            "Refusing connection, server at capacity"
        );
        metrics::record_error("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server at capacity").into_response();
    };

    ws.max_message_size(limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let hub = &state.hub;
    let heartbeat = &state.config.heartbeat;

    let (mut session, mut outbox) = hub.connect();
    let connection_id = session.id().clone();
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies follow the encoding of the last inbound frame.
    let mut encoding = Encoding::default();

    let heartbeat_ms = u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = ServerEvent::connected(connection_id.as_str(), heartbeat_ms);
    if let Err(e) = send_event(&mut sender, &connected, encoding).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected event");
        hub.disconnect(&mut session).await;
        return;
    }

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let interval = Duration::from_millis(heartbeat.interval_ms.max(1));
    let timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection by the hub
            event = outbox.recv() => {
                let Some(event) = event else {
                    debug!(connection = %connection_id, "Outbound queue closed by hub");
                    break;
                };
                if let Err(e) = send_event(&mut sender, &event, encoding).await {
                    debug!(connection = %connection_id, error = %e, "Failed to send event");
                    break;
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() >= timeout {
                    info!(connection = %connection_id, "Heartbeat timeout");
                    metrics::record_error("heartbeat_timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_seen = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => handle_event(&state, &mut session, event, text.len()).await,
                            Err(e) => reject_frame(hub, &session, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        read_buffer.extend_from_slice(&data);

                        loop {
                            let decoded = codec::decode_from_with_limit::<ClientEvent>(
                                &mut read_buffer,
                                max_message_size,
                            );
                            match decoded {
                                Ok(Some(event)) => {
                                    handle_event(&state, &mut session, event, data.len()).await;
                                }
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                                    reject_frame(hub, &session, &e);
                                    read_buffer.clear();
                                    break;
                                }
                                Err(e) => reject_frame(hub, &session, &e),
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
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
                }
            }
        }
    }

    hub.disconnect(&mut session).await;
    metrics::set_online_users(hub.stats().online_users);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Hand one decoded event to the hub.
async fn handle_event(state: &AppState, session: &mut Session, event: ClientEvent, bytes: usize) {
    let start = Instant::now();
    let name = event.name();
    metrics::record_event(name, bytes, "inbound");
    trace!(connection = %session.id(), event = name, "Inbound event");

    let outcome = state.hub.handle(session, event).await;
    metrics::record_outcome(&outcome);
    if matches!(outcome, Outcome::Registered { .. }) {
        metrics::set_online_users(state.hub.stats().online_users);
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Tell the sender its frame could not be decoded. The connection stays open.
fn reject_frame(hub: &Hub, session: &Session, err: &ProtocolError) {
    warn!(connection = %session.id(), error = %err, "Malformed frame");
    metrics::record_error("decode");
    hub.send_to(session.id(), ServerEvent::error(format!("Malformed event: {}", err)));
}

/// Send an event to the WebSocket.
async fn send_event(sender: &mut WsSink, event: &ServerEvent, encoding: Encoding) -> Result<()> {
    let frame = codec::encode_as(event, encoding)?;
    metrics::record_event(event.name(), frame.len(), "outbound");

    let message = match frame {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hark_protocol::{CallMade, Connected, PROTOCOL_VERSION};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    /// Connect and consume the `connected` event.
    async fn connect(addr: SocketAddr) -> (Client, Connected) {
        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Connected(connected) => (ws, connected),
            other => panic!("Expected connected, got {:?}", other),
        }
    }

    async fn send(ws: &mut Client, event: &ClientEvent) {
        let text = codec::encode_json(event).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn next_event(ws: &mut Client) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(WAIT, ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            match msg {
                WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => {
                    let mut buf = BytesMut::from(&data[..]);
                    return codec::decode_from(&mut buf).unwrap().unwrap();
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_alice_and_bob_over_websocket() {
        let (addr, _state) = spawn_server(Config::default()).await;

        let (mut alice, connected) = connect(addr).await;
        assert_eq!(connected.version, PROTOCOL_VERSION);
        assert!(connected.connection_id.starts_with("conn_"));
        let (mut bob, _) = connect(addr).await;

        send(&mut alice, &ClientEvent::register("alice")).await;
        assert_eq!(next_event(&mut alice).await, ServerEvent::status("alice", true));
        assert_eq!(next_event(&mut bob).await, ServerEvent::status("alice", true));

        send(&mut bob, &ClientEvent::register("bob")).await;
        assert_eq!(next_event(&mut alice).await, ServerEvent::status("bob", true));
        assert_eq!(next_event(&mut bob).await, ServerEvent::status("bob", true));

        let offer = json!({"type": "offer", "sdp": "O"});
        send(&mut alice, &ClientEvent::call_user("bob", offer.clone())).await;
        assert_eq!(
            next_event(&mut bob).await,
            ServerEvent::CallMade(CallMade {
                offer,
                from: Some("alice".into()),
            })
        );

        bob.close(None).await.unwrap();
        assert_eq!(next_event(&mut alice).await, ServerEvent::status("bob", false));

        send(&mut alice, &ClientEvent::status("bob")).await;
        assert_eq!(next_event(&mut alice).await, ServerEvent::status("bob", false));
    }

    #[tokio::test]
    async fn test_messagepack_client_gets_binary_replies() {
        let (addr, _state) = spawn_server(Config::default()).await;
        let (mut ws, _) = connect(addr).await;

        let data = codec::encode(&ClientEvent::register("carol")).unwrap();
        ws.send(WsMessage::Binary(data.to_vec())).await.unwrap();

        let msg = tokio::time::timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let WsMessage::Binary(reply) = msg else {
            panic!("Expected binary reply, got {:?}", msg);
        };
        let mut buf = BytesMut::from(&reply[..]);
        let event: ServerEvent = codec::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(event, ServerEvent::status("carol", true));
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_error_and_keeps_connection() {
        let (addr, _state) = spawn_server(Config::default()).await;
        let (mut ws, _) = connect(addr).await;

        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Error(message) => assert!(message.starts_with("Malformed event")),
            other => panic!("Expected error, got {:?}", other),
        }

        send(&mut ws, &ClientEvent::private_message("nobody", "hi")).await;
        assert_eq!(
            next_event(&mut ws).await,
            ServerEvent::error("User nobody is not connected")
        );
    }

    #[tokio::test]
    async fn test_oversized_binary_frame_is_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 1024;
        let (addr, _state) = spawn_server(config).await;
        let (mut ws, _) = connect(addr).await;

        // Only the header of a frame claiming more than the limit.
        ws.send(WsMessage::Binary(1025u32.to_be_bytes().to_vec()))
            .await
            .unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Error(message) => {
                assert!(message.starts_with("Malformed event"));
                assert!(message.contains("exceeds maximum 1024"));
            }
            other => panic!("Expected error, got {:?}", other),
        }

        // The buffer was discarded, so the next frame decodes cleanly.
        let data = codec::encode(&ClientEvent::register("frank")).unwrap();
        ws.send(WsMessage::Binary(data.to_vec())).await.unwrap();
        assert_eq!(next_event(&mut ws).await, ServerEvent::status("frank", true));
    }

    #[test]
    fn test_connection_slots_are_exact() {
        let slots = Arc::new(AtomicUsize::new(0));

        let first = ConnectionSlot::acquire(&slots, 2).unwrap();
        let second = ConnectionSlot::acquire(&slots, 2).unwrap();
        assert!(ConnectionSlot::acquire(&slots, 2).is_none());
        assert_eq!(slots.load(Ordering::SeqCst), 2);

        drop(first);
        let third = ConnectionSlot::acquire(&slots, 2);
        assert!(third.is_some());
        assert!(ConnectionSlot::acquire(&slots, 2).is_none());

        drop(second);
        drop(third);
        assert_eq!(slots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connections_over_limit_are_refused() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (addr, _state) = spawn_server(config).await;

        let (_first, _) = connect(addr).await;
        assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_silent_client_is_dropped() {
        let mut config = Config::default();
        config.heartbeat.interval_ms = 50;
        config.heartbeat.timeout_ms = 150;
        let (addr, state) = spawn_server(config).await;

        let (mut ws, _) = connect(addr).await;
        send(&mut ws, &ClientEvent::register("dave")).await;
        assert_eq!(next_event(&mut ws).await, ServerEvent::status("dave", true));

        // Not reading means no pongs go back.
        tokio::time::sleep(Duration::from_millis(400)).await;

        loop {
            match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
                Some(Ok(WsMessage::Ping(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(other)) => panic!("Unexpected message {:?}", other),
            }
        }

        assert_eq!(state.hub.stats().connections, 0);
        assert!(!state.hub.is_online("dave"));
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let (addr, _state) = spawn_server(Config::default()).await;
        let (mut ws, _) = connect(addr).await;
        send(&mut ws, &ClientEvent::register("erin")).await;
        next_event(&mut ws).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""connections":1"#));
        assert!(response.contains(r#""online":1"#));
        assert!(response.contains(r#""status":"ok""#));
    }
}
