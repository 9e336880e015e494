//! Relay handles and lifecycle state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a relay. Transitions only move forward; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl RelayState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RelayState::Connecting,
            1 => RelayState::Active,
            2 => RelayState::Closing,
            _ => RelayState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Connecting => "connecting",
            RelayState::Active => "active",
            RelayState::Closing => "closing",
            RelayState::Closed => "closed",
        }
    }
}

/// Why a relay was torn down. The code is also sent to the agent in
/// `vnc_close` so it can release the port-forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed its socket
    ClientDisconnect,
    /// Reading from or writing to the client failed
    ClientError,
    /// Agent Send queue was full
    Backpressure,
    /// Tunnel gone or Send queue closed
    AgentDisconnected,
    /// Agent reported `vnc_error`
    AgentError,
    /// Agent sent `vnc_close`
    AgentClosed,
    /// Newer relay for the same session
    Superseded,
    /// Fell behind the agent's Receive stream
    Lagged,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::ClientError => "client_error",
            CloseReason::Backpressure => "backpressure",
            CloseReason::AgentDisconnected => "agent_disconnected",
            CloseReason::AgentError => "agent_error",
            CloseReason::AgentClosed => "agent_closed",
            CloseReason::Superseded => "superseded",
            CloseReason::Lagged => "lagged",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct RelayShared {
    relay_id: Uuid,
    session_id: String,
    user_id: String,
    agent_id: String,
    started_at: DateTime<Utc>,
    state: AtomicU8,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Cloneable handle to one running relay
#[derive(Debug, Clone)]
pub struct RelayHandle {
    inner: Arc<RelayShared>,
}

impl RelayHandle {
    pub(crate) fn new(session_id: String, user_id: String, agent_id: String) -> Self {
        Self {
            inner: Arc::new(RelayShared {
                relay_id: Uuid::new_v4(),
                session_id,
                user_id,
                agent_id,
                started_at: Utc::now(),
                state: AtomicU8::new(RelayState::Connecting as u8),
                reason: OnceLock::new(),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    pub fn relay_id(&self) -> Uuid {
        self.inner.relay_id
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn state(&self) -> RelayState {
        RelayState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// First recorded teardown trigger, if any
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.reason.get().copied()
    }

    /// Ask the relay to tear down.
    ///
    /// Returns true if this call moved the relay into `Closing`. Concurrent
    /// and repeated calls collapse into the first one.
    pub fn close(&self, reason: CloseReason) -> bool {
        let shared = &self.inner;
        let mut current = shared.state.load(Ordering::Acquire);

        loop {
            if current >= RelayState::Closing as u8 {
                return false;
            }
            match shared.state.compare_exchange_weak(
                current,
                RelayState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = shared.reason.set(reason);
                    shared.cancel.cancel();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Resolves once teardown has fully completed
    pub async fn wait_closed(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RelayState::Closed
    }

    /// Connecting -> Active. Fails if a close already won.
    pub(crate) fn activate(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                RelayState::Connecting as u8,
                RelayState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Enter the terminal state. Called once by the relay task after teardown.
    pub(crate) fn mark_closed(&self, fallback: CloseReason) {
        let _ = self.inner.reason.set(fallback);
        self.inner
            .state
            .store(RelayState::Closed as u8, Ordering::Release);
        self.inner.cancel.cancel();
        self.inner.done.cancel();
    }

    pub(crate) fn same_relay(&self, other: &RelayHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
