//! Agent hub for tracking live agent tunnels
//!
//! Each cluster agent keeps one outbound tunnel to the control plane. The hub
//! maps the agent id to that tunnel's [`AgentConnection`], which owns two
//! bounded queues:
//!
//! - **Send**: envelopes headed to the agent. Producers use `try_send`, so a
//!   saturated tunnel is reported immediately instead of buffering.
//! - **Receive**: envelopes the agent sent us, fanned out to every relay
//!   subscribed to this agent. Each relay filters by session id.
//!
//! A newer tunnel for the same agent id supersedes the older one. Closing a
//! connection drops its Receive sender so subscribed relays see the stream
//! end and tear down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deskfabric_proto::{AgentMessage, Envelope, ProtocolError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Agent id must not be empty")]
    EmptyAgentId,

    #[error("Agent not connected: {0}")]
    AgentNotFound(String),

    #[error("Send queue full for agent {0}")]
    QueueFull(String),

    #[error("Agent {0} disconnected")]
    AgentDisconnected(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] ProtocolError),
}

/// Queue sizing for a single agent tunnel
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub send_capacity: usize,
    pub receive_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            send_capacity: 256,
            receive_capacity: 256,
        }
    }
}

/// One live agent tunnel
pub struct AgentConnection {
    agent_id: String,
    connection_id: Uuid,
    platform: String,
    connected_at: DateTime<Utc>,
    last_heartbeat_ms: AtomicI64,
    send_tx: mpsc::Sender<Bytes>,
    send_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    receive_tx: Mutex<Option<broadcast::Sender<Bytes>>>,
    closed: CancellationToken,
}

impl AgentConnection {
    pub fn new(agent_id: impl Into<String>, platform: impl Into<String>, queues: QueueConfig) -> Self {
        let (send_tx, send_rx) = mpsc::channel(queues.send_capacity.max(1));
        let (receive_tx, _) = broadcast::channel(queues.receive_capacity.max(1));
        let now = Utc::now();

        Self {
            agent_id: agent_id.into(),
            connection_id: Uuid::new_v4(),
            platform: platform.into(),
            connected_at: now,
            last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            receive_tx: Mutex::new(Some(receive_tx)),
            closed: CancellationToken::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Unique per tunnel instance; distinguishes a reconnect from its predecessor
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_heartbeat_ms.load(Ordering::Relaxed))
            .unwrap_or(self.connected_at)
    }

    pub fn touch(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn silent_for(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now.timestamp_millis() - self.last_heartbeat_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Handle for producers writing to the agent's Send queue
    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.send_tx.clone()
    }

    /// Queue already-encoded envelope bytes without waiting
    pub fn try_send(&self, bytes: Bytes) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::AgentDisconnected(self.agent_id.clone()));
        }
        self.send_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => HubError::QueueFull(self.agent_id.clone()),
            mpsc::error::TrySendError::Closed(_) => {
                HubError::AgentDisconnected(self.agent_id.clone())
            }
        })
    }

    /// Encode and queue a message without waiting
    pub fn send_message(&self, message: AgentMessage) -> Result<(), HubError> {
        let bytes = Envelope::new(message).encode()?;
        self.try_send(bytes)
    }

    /// Take the consuming end of the Send queue. Only the tunnel writer calls
    /// this; later calls return `None`.
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.send_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Subscribe to envelopes arriving from the agent.
    ///
    /// Returns `None` once the connection is closed.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        let guard = self.receive_tx.lock().ok()?;
        guard.as_ref().map(broadcast::Sender::subscribe)
    }

    /// Fan an inbound envelope out to subscribers. Returns how many received it.
    pub fn deliver(&self, bytes: Bytes) -> usize {
        let Ok(guard) = self.receive_tx.lock() else {
            return 0;
        };
        match guard.as_ref() {
            // Err only means nobody is subscribed right now
            Some(tx) => tx.send(bytes).unwrap_or(0),
            None => 0,
        }
    }

    /// Close both queues. Idempotent.
    pub fn close(&self) {
        if let Ok(mut tx) = self.receive_tx.lock() {
            tx.take();
        }
        // Drop the Send receiver if no writer claimed it, so producers see Closed
        if let Ok(mut rx) = self.send_rx.lock() {
            rx.take();
        }
        if !self.closed.is_cancelled() {
            debug!(
                agent_id = %self.agent_id,
                connection_id = %self.connection_id,
                "Closing agent connection"
            );
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent_id: self.agent_id.clone(),
            connection_id: self.connection_id,
            platform: self.platform.clone(),
            connected_at: self.connected_at,
            last_heartbeat: self.last_heartbeat(),
        }
    }
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("agent_id", &self.agent_id)
            .field("connection_id", &self.connection_id)
            .field("platform", &self.platform)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Point-in-time view of a connected agent
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub connection_id: Uuid,
    pub platform: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Registry of live agent tunnels keyed by agent id
#[derive(Debug, Default)]
pub struct AgentHub {
    agents: DashMap<String, Arc<AgentConnection>>,
}

impl AgentHub {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Install a tunnel, closing any previous tunnel for the same agent.
    ///
    /// Returns the superseded connection, already closed.
    pub fn register(
        &self,
        conn: Arc<AgentConnection>,
    ) -> Result<Option<Arc<AgentConnection>>, HubError> {
        if conn.agent_id().is_empty() {
            return Err(HubError::EmptyAgentId);
        }

        let previous = self.agents.insert(conn.agent_id().to_string(), conn.clone());

        match previous {
            Some(ref old) => {
                old.close();
                info!(
                    agent_id = %conn.agent_id(),
                    platform = %conn.platform(),
                    connection_id = %conn.connection_id(),
                    old_connection_id = %old.connection_id(),
                    old_connected_at = %old.connected_at(),
                    "Agent reconnected, superseded previous tunnel"
                );
            }
            None => {
                info!(
                    agent_id = %conn.agent_id(),
                    platform = %conn.platform(),
                    connection_id = %conn.connection_id(),
                    total_agents = self.agents.len(),
                    "Agent connected"
                );
            }
        }

        Ok(previous)
    }

    /// Remove and close an agent's tunnel. Idempotent.
    pub fn unregister(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        let removed = self.agents.remove(agent_id).map(|(_, conn)| conn);

        match removed {
            Some(ref conn) => {
                conn.close();
                info!(agent_id = %agent_id, "Agent disconnected");
            }
            None => {
                debug!(agent_id = %agent_id, "Unregister for unknown agent");
            }
        }

        removed
    }

    /// Remove the agent only if `connection_id` is still the registered tunnel.
    ///
    /// A superseded tunnel's pumps call this on exit; they must not evict the
    /// tunnel that replaced them.
    pub fn unregister_if_current(&self, agent_id: &str, connection_id: Uuid) -> bool {
        let removed = self
            .agents
            .remove_if(agent_id, |_, conn| conn.connection_id() == connection_id);

        match removed {
            Some((_, conn)) => {
                conn.close();
                info!(
                    agent_id = %agent_id,
                    connection_id = %connection_id,
                    "Agent disconnected"
                );
                true
            }
            None => false,
        }
    }

    pub fn is_agent_connected(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn get_connection(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.agents.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn connected_agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> =
            self.agents.iter().map(|entry| entry.value().summary()).collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    /// Record a heartbeat. Returns false for unknown agents.
    pub fn touch_heartbeat(&self, agent_id: &str) -> bool {
        match self.agents.get(agent_id) {
            Some(conn) => {
                conn.touch();
                true
            }
            None => false,
        }
    }

    /// Evict every agent silent for longer than `max_silence`.
    ///
    /// Returns the evicted agent ids.
    pub fn sweep_stale(&self, max_silence: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut evicted = Vec::new();

        self.agents.retain(|agent_id, conn| {
            let silent = conn.silent_for(now);
            if silent > max_silence {
                warn!(
                    agent_id = %agent_id,
                    silent_secs = silent.as_secs(),
                    "Agent heartbeat timed out, evicting"
                );
                conn.close();
                evicted.push(agent_id.clone());
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Periodically evict silent agents until `shutdown` fires
    pub async fn run_stale_monitor(
        self: Arc<Self>,
        interval: Duration,
        max_silence: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = interval.as_secs(),
            timeout_secs = max_silence.as_secs(),
            "Agent stale monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_stale(max_silence);
                    if !evicted.is_empty() {
                        info!(count = evicted.len(), "Evicted stale agents");
                    }
                }
            }
        }

        debug!("Agent stale monitor stopped");
    }

    /// Queue a message for one agent without waiting
    pub fn send_to_agent(&self, agent_id: &str, message: AgentMessage) -> Result<(), HubError> {
        let conn = self
            .get_connection(agent_id)
            .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))?;
        conn.send_message(message)
    }

    /// Queue a message for every agent except `exclude`.
    ///
    /// Returns how many agents accepted it; full queues are skipped.
    pub fn broadcast(&self, message: AgentMessage, exclude: Option<&str>) -> Result<usize, HubError> {
        let bytes = Envelope::new(message).encode()?;

        let targets: Vec<Arc<AgentConnection>> = self
            .agents
            .iter()
            .filter(|entry| Some(entry.key().as_str()) != exclude)
            .map(|entry| entry.value().clone())
            .collect();

        let mut delivered = 0;
        for conn in targets {
            match conn.try_send(bytes.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(agent_id = %conn.agent_id(), error = %e, "Broadcast skipped agent"),
            }
        }

        Ok(delivered)
    }

    /// Close every tunnel
    pub fn close_all(&self) {
        let ids: Vec<String> = self.agents.iter().map(|e| e.key().clone()).collect();
        for agent_id in ids {
            self.unregister(&agent_id);
        }
    }
}
