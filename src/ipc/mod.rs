//! Connection lifecycle: WebSocket upgrade, handshake auth, per-connection
//! read/write loop, and the background tasks (heartbeat sweep, retry
//! scheduler, router) that run once per process.
//!
//! One `TcpListener` serves both the WebSocket upgrade and a plain-HTTP
//! health check on the same port, same shape as the daemon this crate's
//! connection-handling code started from: peek the first bytes, branch to a
//! raw HTTP response for `GET /health`, otherwise upgrade.

use crate::auth::extract_token;
use crate::codec::{decode_and_validate, format_timestamp_now, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::envelope::{Envelope, MessageType, Priority, WireEnvelope};
use crate::error::GatewayError;
use crate::pubsub::PublishedMessage;
use crate::reconnect::ReconnectOutcome;
use crate::registry::{ConnectionId, ConnectionState, OutboundFrame, SocketHandle};
use crate::security;
use crate::Core;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WS_PATH: &str = "/ws";
const ALLOWED_SUBPROTOCOLS: &[&str] = &["gateway.v1"];
const MAX_CONNECTIONS_PER_MIN: usize = 30;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Handshake metadata captured synchronously in the upgrade callback —
/// `tokio_tungstenite`'s callback can't itself await the token validator, so
/// it stashes what it read off the request and the caller validates once
/// the handshake future resolves.
#[derive(Default, Clone)]
struct HandshakeInfo {
    authorization: Option<String>,
    subprotocols: Vec<String>,
    query: HashMap<String, String>,
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn split_subprotocols(header: &str) -> Vec<String> {
    header.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

/// Per-IP accept-loop rate limiter — distinct from the Registry's
/// per-connection message rate limit, which only applies once a connection
/// already exists.
struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
}

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { connections: HashMap::new() }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - Duration::from_secs(60);
        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);
        if timestamps.len() >= MAX_CONNECTIONS_PER_MIN {
            return false;
        }
        timestamps.push(now);
        true
    }
}

pub async fn run(core: Arc<Core>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", core.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening (WebSocket + HTTP health on same port)");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (retry_notify, mut retry_notified) = mpsc::unbounded_channel::<String>();
    let scheduler = core.retry_scheduler.clone();
    let retry_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { scheduler.run(retry_notify, retry_shutdown).await });
    // Retry due-messages are delivered on their owner's next `send_user` call;
    // this just drains the channel so the scheduler never blocks on a full one.
    tokio::spawn(async move { while retry_notified.recv().await.is_some() {} });

    tokio::spawn(heartbeat_sweep_loop(core.clone(), shutdown_rx.clone()));
    tokio::spawn(router_task(core.clone(), shutdown_rx.clone()));

    let conn_limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));
    let shutdown_signal = shutdown_signal();
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_signal => {
                info!("shutdown signal received — closing connections");
                let _ = shutdown_tx.send(true);
                drain(&core).await;
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                let core = core.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, core, shutdown_rx).await {
                        debug!(peer = %peer, err = %e, "connection ended with error");
                    }
                });
            }
        }
    }

    info!("gateway stopped");
    Ok(())
}

/// Give already-accepted connections a window to notice the shutdown signal,
/// flush their batcher, and close cleanly before the process exits.
async fn drain(core: &Arc<Core>) {
    let deadline = Duration::from_secs(core.config.performance.drain_deadline_secs);
    tokio::time::sleep(deadline).await;
    let stats = core.registry.stats().await;
    info!(remaining_connections = stats.total_connections, "drain window elapsed");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Respond to `GET /health` with a small JSON status document, sharing the
/// WebSocket port so operators don't need a WS client to probe liveness.
async fn handle_health_check(mut stream: TcpStream, core: &Core) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let registry_stats = core.registry.stats().await;
    let buffer_stats = core.buffer.stats().await;
    let outstanding = buffer_stats
        .messages_buffered
        .saturating_sub(buffer_stats.messages_delivered)
        .saturating_sub(buffer_stats.messages_dropped);

    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": core.started_at.elapsed().as_secs(),
        "connections": registry_stats.total_connections,
        "users": registry_stats.total_users,
        "rooms": registry_stats.total_rooms,
        "buffered_messages": outstanding,
        "port": core.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    core: Arc<Core>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &core).await;
    }

    let captured: Arc<StdMutex<HandshakeInfo>> = Arc::new(StdMutex::new(HandshakeInfo::default()));
    let captured_cb = captured.clone();

    let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() != WS_PATH {
            return Err(http::Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(None::<String>)
                .expect("static response is well-formed"));
        }

        let authorization = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let subprotocols = request
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .map(split_subprotocols)
            .unwrap_or_default();

        if !subprotocols.is_empty() {
            match subprotocols.iter().find(|p| ALLOWED_SUBPROTOCOLS.contains(&p.as_str())) {
                Some(proto) => {
                    response.headers_mut().insert(
                        "sec-websocket-protocol",
                        HeaderValue::from_str(proto).expect("allow-listed protocol names are valid header values"),
                    );
                }
                None => {
                    return Err(http::Response::builder()
                        .status(StatusCode::BAD_REQUEST)
                        .body(None::<String>)
                        .expect("static response is well-formed"));
                }
            }
        }

        let query = request.uri().query().map(parse_query).unwrap_or_default();
        *captured_cb.lock().expect("handshake capture mutex poisoned") = HandshakeInfo { authorization, subprotocols, query };
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(DEFAULT_MAX_PAYLOAD_BYTES * 4),
        max_frame_size: Some(DEFAULT_MAX_PAYLOAD_BYTES * 2),
        ..Default::default()
    };

    let mut ws = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let info = captured.lock().expect("handshake capture mutex poisoned").clone();

    let query_token = info.query.get("token").cloned();
    let token = extract_token(info.authorization.as_deref(), &info.subprotocols, query_token.as_deref());

    let claims = match token {
        Some(t) => match core.token_validator.validate(&t).await {
            Ok(c) => c,
            Err(e) => {
                close_ws(&mut ws, e.close_code().unwrap_or(1008), e.to_string()).await;
                return Ok(());
            }
        },
        None => {
            close_ws(&mut ws, 1008, GatewayError::AuthInvalid.to_string()).await;
            return Ok(());
        }
    };

    let user_id = claims.user_id().to_string();
    let requested_session = info.query.get("session_id").cloned();
    let (session_id, reconnecting) = match &requested_session {
        Some(sid) if security::validate_session_id(sid).is_ok() => (sid.clone(), true),
        _ => (Uuid::new_v4().to_string(), false),
    };

    let connection_id = Uuid::new_v4();
    let (tx, rx): (SocketHandle, mpsc::UnboundedReceiver<OutboundFrame>) = mpsc::unbounded_channel();

    if let Err(e) = core.registry.register(connection_id, user_id.clone(), session_id.clone(), tx.clone()).await {
        warn!(peer = %peer, err = %e, "registration rejected");
        close_ws(&mut ws, e.close_code().unwrap_or(1011), e.to_string()).await;
        return Ok(());
    }
    core.heartbeat.track(connection_id).await;

    if reconnecting {
        match core.reconnect.attempt_reconnect(&session_id, &claims).await {
            Ok(ReconnectOutcome::Resync { snapshot, resync_reason }) => {
                let envelope = Envelope::new(
                    MessageType::StateResync,
                    serde_json::json!({ "snapshot": snapshot, "reason": resync_reason }),
                    Priority::High,
                    MessageType::DEFAULT_CRITICAL_KINDS,
                );
                let _ = tx.send(OutboundFrame::Envelope(envelope));
                if let Err(e) = core.reconnect.drain_buffered(&session_id, &user_id).await {
                    warn!(session_id = %session_id, err = %e, "failed to drain buffered messages on reconnect");
                }
            }
            Ok(ReconnectOutcome::ResyncRequired) => {}
            Ok(ReconnectOutcome::RateLimited) => {
                send_error_frame(&tx, GatewayError::RateLimit);
            }
            Ok(ReconnectOutcome::Exhausted) => {
                send_error_frame(&tx, GatewayError::ReconnectExhausted);
                core.registry.deregister(connection_id).await;
                core.heartbeat.untrack(connection_id).await;
                return Ok(());
            }
            Err(e) => {
                warn!(session_id = %session_id, err = %e, "reconnect rejected");
                core.registry.deregister(connection_id).await;
                core.heartbeat.untrack(connection_id).await;
                return Ok(());
            }
        }
    }
    core.reconnect.mark_connected(&session_id, &user_id).await;

    let welcome = serde_json::json!({
        "event": "connection_established",
        "connection_id": connection_id.to_string(),
        "connection_ready": true,
        "session_id": session_id,
        "server_time": format_timestamp_now(),
    });
    let _ = tx.send(OutboundFrame::Envelope(Envelope::new(
        MessageType::ConnectionEstablished,
        welcome,
        Priority::Critical,
        &[],
    )));

    info!(connection = %connection_id, user = %user_id, session = %session_id, reconnecting, "connection established");

    let (sink, stream) = ws.split();
    let result = connection_loop(core.clone(), connection_id, &user_id, &session_id, sink, stream, rx, shutdown_rx).await;

    core.registry.deregister(connection_id).await;
    core.heartbeat.untrack(connection_id).await;
    core.broadcaster.forget(connection_id).await;
    core.reconnect.mark_disconnected(&session_id, &user_id).await;
    if let Some(snapshot) = core.state_store.load(&session_id).await {
        if let Ok(value) = serde_json::to_value(&snapshot) {
            core.state_store.save_disconnection_state(&session_id, value).await;
        }
    }

    result
}

async fn close_ws(ws: &mut WebSocketStream<TcpStream>, code: u16, reason: String) {
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
    let _ = ws.send(Message::Close(Some(frame))).await;
}

fn send_error_frame(tx: &SocketHandle, err: GatewayError) {
    let envelope = Envelope::new(
        MessageType::Error,
        serde_json::to_value(err.to_frame(serde_json::json!({}))).unwrap_or_default(),
        Priority::High,
        &[],
    );
    let _ = tx.send(OutboundFrame::Envelope(envelope));
}

async fn send_one(sink: &mut WsSink, envelope: &Envelope) -> Result<(), ()> {
    let text = serde_json::to_string(&envelope.to_wire()).unwrap_or_default();
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

async fn send_error_frame_direct(sink: &mut WsSink, err: GatewayError) {
    let frame = err.to_frame(serde_json::json!({}));
    let _ = sink.send(Message::Text(serde_json::to_string(&frame).unwrap_or_default())).await;
}

/// Drain `target`'s batcher and write its contents as one JSON array frame —
/// a no-op if nothing is accumulated.
async fn flush_batch(core: &Arc<Core>, target: &str, sink: &mut WsSink) {
    let envelopes = core.batcher.flush(target).await;
    if envelopes.is_empty() {
        return;
    }
    let wire: Vec<WireEnvelope> = envelopes.iter().map(Envelope::to_wire).collect();
    let text = serde_json::to_string(&wire).unwrap_or_default();
    let _ = sink.send(Message::Text(text)).await;
}

/// Per-connection read/write loop: inbound text frames are validated and
/// published onto the internal bus; outbound frames arrive pre-routed from
/// the Broadcaster and are either sent immediately (critical/high-priority,
/// or a raw ping) or handed to the batcher for this connection's target.
async fn connection_loop(
    core: Arc<Core>,
    connection_id: ConnectionId,
    user_id: &str,
    session_id: &str,
    mut sink: WsSink,
    mut stream: WsStream,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let target = format!("conn:{connection_id}");
    let tick_ms = (core.config.batch.max_wait_ms / 2).max(10);
    let mut batch_tick = tokio::time::interval(Duration::from_millis(tick_ms));

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    flush_batch(&core, &target, &mut sink).await;
                    let frame = CloseFrame { code: CloseCode::Away, reason: "server shutting down".into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }

            _ = batch_tick.tick() => {
                if core.batcher.should_flush(&target).await {
                    flush_batch(&core, &target, &mut sink).await;
                }
            }

            outbound = rx.recv() => {
                match outbound {
                    Some(OutboundFrame::Ping) => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Envelope(envelope)) => {
                        if envelope.critical_kind || envelope.priority >= core.config.batch.priority_threshold {
                            if send_one(&mut sink, &envelope).await.is_err() {
                                break;
                            }
                        } else {
                            core.batcher.push(&target, envelope).await;
                            if core.batcher.should_flush(&target).await {
                                flush_batch(&core, &target, &mut sink).await;
                            }
                        }
                    }
                    None => break,
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !core.registry.rate_check(connection_id).await {
                            send_error_frame_direct(&mut sink, GatewayError::RateLimit).await;
                            continue;
                        }
                        match handle_text_frame(&core, connection_id, user_id, session_id, &text, &mut sink).await {
                            Ok(()) => {}
                            Err(()) => break,
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        core.heartbeat.record_pong(connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, err = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Validate and act on one inbound text frame. `Err(())` means the frame
/// tripped a security-class validation failure and the connection must close.
async fn handle_text_frame(
    core: &Arc<Core>,
    connection_id: ConnectionId,
    user_id: &str,
    session_id: &str,
    text: &str,
    sink: &mut WsSink,
) -> Result<(), ()> {
    match decode_and_validate(text, DEFAULT_MAX_PAYLOAD_BYTES) {
        Ok(wire) => {
            core.registry.record_activity(connection_id).await;

            if wire.kind == MessageType::Ping {
                core.heartbeat.record_pong(connection_id).await;
                let pong = WireEnvelope {
                    kind: MessageType::Pong,
                    payload: serde_json::json!({}),
                    timestamp: format_timestamp_now(),
                    sender: None,
                    correlation_id: wire.correlation_id,
                };
                let _ = sink.send(Message::Text(serde_json::to_string(&pong).unwrap_or_default())).await;
                return Ok(());
            }

            let mut envelope = Envelope::new(wire.kind, wire.payload, Priority::Normal, MessageType::DEFAULT_CRITICAL_KINDS);
            envelope.sender = Some(user_id.to_string());
            envelope.correlation_id = wire.correlation_id;
            core.pubsub.publish(format!("session:{session_id}"), envelope);
            Ok(())
        }
        Err((class, err)) => {
            send_error_frame_direct(sink, err).await;
            if class.closes_connection() {
                Err(())
            } else {
                Ok(())
            }
        }
    }
}

/// The single subscriber of the internal bus — every published message is
/// routed exactly once here, never independently per connection, or a
/// broadcast would be dispatched once per currently-subscribed connection
/// instead of once per message.
async fn router_task(core: Arc<Core>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut rx = core.pubsub.subscribe();
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    return;
                }
            }

            msg = rx.recv() => {
                match msg {
                    Ok(PublishedMessage { channel, envelope }) => {
                        core.router.route(&channel, envelope).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "router task lagged behind the internal bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

/// Periodic heartbeat sweep: ping connections due for one, evict anything
/// silent past `dead_after`.
async fn heartbeat_sweep_loop(core: Arc<Core>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(core.heartbeat.ping_interval());
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    return;
                }
            }

            _ = interval.tick() => {
                let result = core.heartbeat.sweep().await;

                for id in result.to_ping {
                    if let Some(socket) = core.registry.get_socket(id).await {
                        let _ = socket.send(OutboundFrame::Ping);
                    }
                }

                for id in result.dead {
                    if let Some(user_id) = core.registry.get_user(id).await {
                        core.registry.set_state(id, ConnectionState::Closing).await;
                        core.registry.deregister(id).await;
                        core.heartbeat.untrack(id).await;
                        core.broadcaster.forget(id).await;
                        debug!(connection = %id, user = %user_id, "heartbeat monitor evicted dead connection");
                    }
                }
            }
        }
    }
}
