//! Session relay: bridges one client's VNC stream through an agent tunnel
//!
//! Establishing a relay is split in two so the HTTP layer can reject a request
//! before upgrading the connection:
//!
//! 1. [`SessionRelay::authorize`] checks the routing preconditions and
//!    allocates nothing.
//! 2. [`SessionRelay::start`] takes the upgraded transport, claims the
//!    session's slot and spawns the relay task.
//!
//! The relay task runs two pumps under one cancellation token:
//!
//! ```text
//!   client ──frames──> [inbound pump]  ──vnc_data──> agent Send queue
//!   client <──frames── [outbound pump] <──envelopes── agent Receive stream
//! ```
//!
//! Whichever pump stops first records the close reason and cancels the
//! other. Teardown then runs exactly once, after both have returned.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use deskfabric_proto::{AgentMessage, Envelope};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::{AccessPolicy, OwnerOnly};
use crate::active_relays::ActiveRelays;
use crate::directory::{DirectoryError, SessionDirectory};
use crate::hub::AgentHub;
use crate::relay_handle::{CloseReason, RelayHandle, RelayState};
use crate::transport::{ClientTransport, FrameSink, FrameSource};
use crate::SessionState;

/// Longest accepted session id (a DNS label-sized pod name)
pub const MAX_SESSION_ID_LEN: usize = 253;

/// Reasons a relay cannot be established
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid session id: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Access denied")]
    Forbidden,

    #[error("Session is not running (state: {0})")]
    Conflict(SessionState),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Session directory error: {0}")]
    Directory(#[from] DirectoryError),
}

impl RelayError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "invalid_session_id",
            RelayError::NotFound(_) => "session_not_found",
            RelayError::Forbidden => "forbidden",
            RelayError::Conflict(_) => "session_not_running",
            RelayError::ServiceUnavailable(_) => "agent_unavailable",
            RelayError::Directory(_) => "internal_error",
        }
    }
}

/// Check a session id before it reaches the directory
pub fn validate_session_id(session_id: &str) -> Result<(), RelayError> {
    if session_id.is_empty() {
        return Err(RelayError::Validation("session id is required".to_string()));
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(RelayError::Validation(format!(
            "session id longer than {} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if let Some(c) = session_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(RelayError::Validation(format!(
            "unexpected character {:?} in session id",
            c
        )));
    }
    Ok(())
}

/// Proof that every precondition passed for one session and caller
#[derive(Debug, Clone, PartialEq)]
pub struct RelayTicket {
    session_id: String,
    user_id: String,
    agent_id: String,
}

impl RelayTicket {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

/// Establishes and tracks VNC relays
#[derive(Clone)]
pub struct SessionRelay {
    hub: Arc<AgentHub>,
    directory: Arc<dyn SessionDirectory>,
    access: Arc<dyn AccessPolicy>,
    relays: Arc<ActiveRelays>,
}

impl SessionRelay {
    pub fn new(hub: Arc<AgentHub>, directory: Arc<dyn SessionDirectory>) -> Self {
        Self {
            hub,
            directory,
            access: Arc::new(OwnerOnly),
            relays: Arc::new(ActiveRelays::new()),
        }
    }

    pub fn with_access_policy(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    pub fn hub(&self) -> &Arc<AgentHub> {
        &self.hub
    }

    pub fn active_relays(&self) -> &Arc<ActiveRelays> {
        &self.relays
    }

    /// Check every precondition for `user_id` to attach to `session_id`.
    ///
    /// Checks run in a fixed order and the first failure is returned.
    pub async fn authorize(&self, session_id: &str, user_id: &str) -> Result<RelayTicket, RelayError> {
        validate_session_id(session_id)?;

        let session = self
            .directory
            .lookup(session_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(session_id.to_string()))?;

        if !self.access.can_access(user_id, &session).await {
            warn!(
                session_id = %session_id,
                user_id = %user_id,
                "VNC access denied"
            );
            return Err(RelayError::Forbidden);
        }

        if session.state != SessionState::Running {
            debug!(session_id = %session_id, state = %session.state, "Session not running");
            return Err(RelayError::Conflict(session.state));
        }

        let agent_id = match session.agent_id {
            Some(agent_id) if !agent_id.is_empty() => agent_id,
            _ => {
                return Err(RelayError::ServiceUnavailable(
                    "Session not yet claimed by an agent".to_string(),
                ))
            }
        };

        if !self.hub.is_agent_connected(&agent_id) {
            return Err(RelayError::ServiceUnavailable(format!(
                "Agent {} is offline",
                agent_id
            )));
        }

        Ok(RelayTicket {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            agent_id,
        })
    }

    /// Spawn the relay task for an authorized, upgraded client.
    ///
    /// The relay takes the session's slot before this returns, so of two
    /// back to back calls for one session the later one always wins.
    /// Must be called from within a tokio runtime.
    pub fn start<T: ClientTransport>(&self, ticket: RelayTicket, transport: T) -> RelayHandle {
        let handle = RelayHandle::new(ticket.session_id, ticket.user_id, ticket.agent_id);
        let (source, sink) = transport.split();

        self.relays.install(handle.clone());
        tokio::spawn(self.clone().run(handle.clone(), source, sink));

        handle
    }

    /// [`authorize`](Self::authorize) then [`start`](Self::start)
    pub async fn establish<T: ClientTransport>(
        &self,
        session_id: &str,
        user_id: &str,
        transport: T,
    ) -> Result<RelayHandle, RelayError> {
        let ticket = self.authorize(session_id, user_id).await?;
        Ok(self.start(ticket, transport))
    }

    pub fn active_count(&self) -> usize {
        self.relays.count()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.relays.is_active(session_id)
    }

    /// Close the relay attached to a session, if any
    pub fn close_session(&self, session_id: &str) -> bool {
        self.relays.close(session_id, CloseReason::Shutdown)
    }

    /// Close every relay and wait for their teardown to finish
    pub async fn shutdown(&self) -> usize {
        let handles = self.relays.handles();
        let count = handles.len();

        for handle in &handles {
            handle.close(CloseReason::Shutdown);
        }
        for handle in handles {
            handle.wait_closed().await;
        }

        info!(count, "All VNC relays closed");
        count
    }

    async fn run<S, K>(self, handle: RelayHandle, mut source: S, mut sink: K)
    where
        S: FrameSource,
        K: FrameSink,
    {
        let session_id = handle.session_id().to_string();
        let agent_id = handle.agent_id().to_string();

        // The agent may have dropped between authorize and start
        let attached = self
            .hub
            .get_connection(&agent_id)
            .and_then(|conn| conn.subscribe().map(|rx| (conn, rx)));
        let Some((conn, agent_rx)) = attached else {
            warn!(
                session_id = %session_id,
                agent_id = %agent_id,
                "Agent went offline before VNC relay started"
            );
            handle.close(CloseReason::AgentDisconnected);
            if let Err(e) = sink.close().await {
                debug!(session_id = %session_id, error = %e, "Client close failed");
            }
            self.relays.remove_if_current(&session_id, handle.relay_id());
            handle.mark_closed(CloseReason::AgentDisconnected);
            return;
        };

        // Skip the counter if superseded or closed before the task got to run
        let counted = if handle.state() == RelayState::Connecting {
            match self.directory.record_connect(&session_id, Utc::now()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to record VNC connect");
                    false
                }
            }
        } else {
            false
        };

        if handle.activate() {
            info!(
                session_id = %session_id,
                agent_id = %agent_id,
                relay_id = %handle.relay_id(),
                user_id = %handle.user_id(),
                "VNC relay active"
            );

            let cancel = handle.cancel_token().clone();
            let inbound = async {
                if let Some(reason) =
                    pump_client_to_agent(&session_id, &mut source, conn.sender(), &cancel).await
                {
                    handle.close(reason);
                }
            };
            let outbound = async {
                if let Some(reason) =
                    pump_agent_to_client(&session_id, agent_rx, &mut sink, &cancel).await
                {
                    handle.close(reason);
                }
            };
            tokio::join!(inbound, outbound);
        }

        // Teardown, runs once
        let reason = handle.close_reason().unwrap_or(CloseReason::ClientDisconnect);

        if let Err(e) = sink.close().await {
            debug!(session_id = %session_id, error = %e, "Client close failed");
        }

        self.relays.remove_if_current(&session_id, handle.relay_id());

        if counted {
            if let Err(e) = self.directory.record_disconnect(&session_id, Utc::now()).await {
                warn!(session_id = %session_id, error = %e, "Failed to record VNC disconnect");
            }
        }

        // Best effort; agents run their own idle timeout
        if reason != CloseReason::AgentDisconnected {
            if let Err(e) = conn.send_message(AgentMessage::vnc_close(&session_id, reason.as_str())) {
                debug!(session_id = %session_id, error = %e, "Could not notify agent of VNC close");
            }
        }

        handle.mark_closed(reason);

        let duration = Utc::now() - handle.started_at();
        info!(
            session_id = %session_id,
            agent_id = %agent_id,
            relay_id = %handle.relay_id(),
            reason = %reason,
            duration_secs = duration.num_seconds(),
            "VNC relay closed"
        );
    }
}

impl std::fmt::Debug for SessionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRelay")
            .field("agents", &self.hub.count())
            .field("active_relays", &self.relays.count())
            .finish()
    }
}

/// Client -> agent. Returns `None` when cancelled by the sibling pump or an
/// external close.
async fn pump_client_to_agent<S: FrameSource>(
    session_id: &str,
    source: &mut S,
    agent_tx: mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> Option<CloseReason> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            frame = source.recv_frame() => frame,
        };

        let data = match frame {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!(session_id = %session_id, "Client closed VNC connection");
                return Some(CloseReason::ClientDisconnect);
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Client read failed");
                return Some(CloseReason::ClientError);
            }
        };

        let envelope = match Envelope::new(AgentMessage::vnc_data(session_id, data)).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to encode client frame");
                return Some(CloseReason::ClientError);
            }
        };

        match agent_tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %session_id, "Agent send queue full, closing VNC relay");
                return Some(CloseReason::Backpressure);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session_id = %session_id, "Agent send queue closed");
                return Some(CloseReason::AgentDisconnected);
            }
        }
    }
}

/// Agent -> client. Returns `None` when cancelled.
async fn pump_agent_to_client<K: FrameSink>(
    session_id: &str,
    mut agent_rx: broadcast::Receiver<Bytes>,
    sink: &mut K,
    cancel: &CancellationToken,
) -> Option<CloseReason> {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            received = agent_rx.recv() => received,
        };

        let bytes = match received {
            Ok(bytes) => bytes,
            Err(RecvError::Lagged(skipped)) => {
                warn!(session_id = %session_id, skipped, "VNC relay fell behind agent stream");
                return Some(CloseReason::Lagged);
            }
            Err(RecvError::Closed) => {
                debug!(session_id = %session_id, "Agent tunnel closed");
                return Some(CloseReason::AgentDisconnected);
            }
        };

        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Dropping malformed agent message");
                continue;
            }
        };

        if envelope.message.session_id() != Some(session_id) {
            continue;
        }

        match envelope.message {
            AgentMessage::VncData(payload) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    sent = sink.send_frame(payload.data) => sent,
                };
                if let Err(e) = sent {
                    debug!(session_id = %session_id, error = %e, "Client write failed");
                    return Some(CloseReason::ClientError);
                }
            }
            AgentMessage::VncClose(payload) => {
                info!(session_id = %session_id, reason = %payload.reason, "Agent closed VNC tunnel");
                return Some(CloseReason::AgentClosed);
            }
            AgentMessage::VncError(payload) => {
                warn!(session_id = %session_id, error = %payload.error, "Agent reported VNC tunnel error");
                return Some(CloseReason::AgentError);
            }
            AgentMessage::VncReady(payload) => {
                debug!(session_id = %session_id, vnc_port = payload.vnc_port, "Agent VNC tunnel ready");
            }
            _ => {}
        }
    }
}
