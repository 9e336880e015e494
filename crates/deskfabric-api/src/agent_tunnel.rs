//! Agent-facing tunnel endpoint
//!
//! An agent dials `GET /api/v1/agents/connect` and keeps the WebSocket open.
//! One text message carries one envelope in each direction. The connection
//! is split into a writer task draining the agent's Send queue and a reader
//! loop that feeds session traffic into the Receive stream.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use deskfabric_control::AgentConnection;
use deskfabric_proto::{AgentMessage, Envelope, MAX_ENVELOPE_SIZE};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::models::{AgentConnectQuery, ErrorResponse};
use crate::AppState;

/// Header carrying the shared agent key
pub const AGENT_KEY_HEADER: &str = "x-agent-key";

/// Keepalive and size limits for agent tunnels
#[derive(Debug, Clone, Copy)]
pub struct AgentTunnelConfig {
    /// How often the server pings the agent
    pub ping_interval: Duration,
    /// Tear the tunnel down after this long without any inbound message
    pub read_timeout: Duration,
    /// Give up on a single outbound write after this long
    pub write_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for AgentTunnelConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: MAX_ENVELOPE_SIZE,
        }
    }
}

/// Accept an agent tunnel
#[utoipa::path(
    get,
    path = "/api/v1/agents/connect",
    params(AgentConnectQuery),
    responses(
        (status = 101, description = "Switching to WebSocket; text frames carry envelopes"),
        (status = 400, description = "Missing agent id", body = ErrorResponse),
        (status = 401, description = "Missing or wrong agent key", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn agent_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AgentConnectQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let agent_id = query.agent_id.trim().to_string();
    if agent_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("agent_id is required", "MISSING_AGENT_ID")),
        )
            .into_response();
    }

    if let Some(expected) = state.agent_key.as_deref() {
        let presented = headers
            .get(AGENT_KEY_HEADER)
            .and_then(|value| value.to_str().ok());
        if presented != Some(expected) {
            warn!(agent_id = %agent_id, "Agent presented an invalid key");
            return (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Invalid agent key", "INVALID_AGENT_KEY")),
            )
                .into_response();
        }
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let platform = query.platform.unwrap_or_else(|| "unknown".to_string());
    ws.max_message_size(state.tunnel.max_message_size)
        .on_upgrade(move |socket| run_agent_tunnel(state, socket, agent_id, platform))
}

/// Serve one agent tunnel until either side goes away
pub async fn run_agent_tunnel(
    state: Arc<AppState>,
    socket: WebSocket,
    agent_id: String,
    platform: String,
) {
    let conn = Arc::new(AgentConnection::new(agent_id.clone(), platform, state.queues));
    let connection_id = conn.connection_id();

    if let Err(e) = state.hub.register(conn.clone()) {
        error!(agent_id = %agent_id, "Failed to register agent: {}", e);
        return;
    }

    let Some(outbound) = conn.take_outbound() else {
        error!(agent_id = %agent_id, "Agent send queue already claimed");
        state.hub.unregister_if_current(&agent_id, connection_id);
        return;
    };

    info!(
        agent_id = %agent_id,
        connection_id = %connection_id,
        platform = %conn.platform(),
        "Agent tunnel established"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(conn.clone(), sink, outbound, state.tunnel));

    read_loop(&conn, stream, state.tunnel).await;

    // Superseded tunnels must not evict their successor
    if !state.hub.unregister_if_current(&agent_id, connection_id) {
        conn.close();
    }
    let _ = writer.await;

    info!(agent_id = %agent_id, connection_id = %connection_id, "Agent tunnel closed");
}

async fn read_loop(
    conn: &AgentConnection,
    mut stream: SplitStream<WebSocket>,
    config: AgentTunnelConfig,
) {
    loop {
        let next = tokio::select! {
            _ = conn.closed() => {
                debug!(agent_id = %conn.agent_id(), "Agent connection closed locally");
                return;
            }
            next = timeout(config.read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!(
                    agent_id = %conn.agent_id(),
                    timeout_secs = config.read_timeout.as_secs(),
                    "Agent tunnel read timeout"
                );
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(agent_id = %conn.agent_id(), "Agent tunnel read error: {}", e);
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        // Any inbound frame proves the tunnel is alive
        conn.touch();

        match message {
            Message::Text(text) => {
                dispatch(conn, Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            Message::Binary(data) => dispatch(conn, data),
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(frame) => {
                debug!(agent_id = %conn.agent_id(), "Agent sent close frame: {:?}", frame);
                return;
            }
        }
    }
}

fn dispatch(conn: &AgentConnection, bytes: Bytes) {
    let agent_id = conn.agent_id();

    let kind = match Envelope::peek_kind(&bytes) {
        Ok(kind) => kind,
        Err(e) => {
            warn!(agent_id = %agent_id, "Dropping malformed agent message: {}", e);
            return;
        }
    };

    // Relays decode session traffic themselves; forward the raw envelope
    if kind.is_session_traffic() {
        let receivers = conn.deliver(bytes);
        trace!(agent_id = %agent_id, kind = kind.as_str(), receivers, "Delivered session traffic");
        return;
    }

    match Envelope::decode(&bytes) {
        Ok(envelope) => log_control_message(agent_id, envelope.message),
        Err(e) => warn!(agent_id = %agent_id, "Dropping malformed agent message: {}", e),
    }
}

fn log_control_message(agent_id: &str, message: AgentMessage) {
    match message {
        AgentMessage::Heartbeat(hb) => debug!(
            agent_id = %agent_id,
            status = %hb.status,
            active_sessions = hb.active_sessions,
            "Agent heartbeat"
        ),
        AgentMessage::Pong(_) => trace!(agent_id = %agent_id, "Agent pong"),
        AgentMessage::Ack(ack) => {
            debug!(agent_id = %agent_id, command_id = %ack.command_id, "Command acknowledged")
        }
        AgentMessage::Complete(done) => {
            info!(agent_id = %agent_id, command_id = %done.command_id, "Command completed")
        }
        AgentMessage::Failed(failed) => warn!(
            agent_id = %agent_id,
            command_id = %failed.command_id,
            "Command failed: {}",
            failed.error
        ),
        AgentMessage::Status(status) => debug!(
            agent_id = %agent_id,
            session_id = %status.session_id,
            state = %status.state,
            vnc_ready = status.vnc_ready,
            "Session status update"
        ),
        other => warn!(
            agent_id = %agent_id,
            kind = other.kind().as_str(),
            "Unexpected message type from agent"
        ),
    }
}

async fn write_loop(
    conn: Arc<AgentConnection>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Bytes>,
    config: AgentTunnelConfig,
) {
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let message = tokio::select! {
            _ = conn.closed() => break,
            _ = ping.tick() => Message::Ping(Bytes::new()),
            next = outbound.recv() => match next {
                Some(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Message::Text(text.into()),
                    Err(_) => {
                        warn!(agent_id = %conn.agent_id(), "Skipping non UTF-8 envelope");
                        continue;
                    }
                },
                None => break,
            },
        };

        match timeout(config.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(agent_id = %conn.agent_id(), "Agent tunnel write error: {}", e);
                break;
            }
            Err(_) => {
                warn!(agent_id = %conn.agent_id(), "Agent tunnel write timeout");
                break;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    // Wakes the reader if the writer stopped first
    conn.close();
}
