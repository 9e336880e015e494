use chrono::{DateTime, Utc};
use deskfabric_control::{AgentSummary, RelayHandle};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Connected agent tunnels
    pub connected_agents: usize,
    /// Active VNC relays
    pub active_relays: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: &str) -> Self {
        Self {
            error: error.into(),
            code: Some(code.to_string()),
        }
    }
}

/// A connected agent tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentInfo {
    /// Agent identifier
    pub agent_id: String,
    /// Identifier of this particular tunnel connection
    pub connection_id: Uuid,
    /// Platform reported by the agent (e.g. "kubernetes")
    pub platform: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<AgentSummary> for AgentInfo {
    fn from(summary: AgentSummary) -> Self {
        Self {
            agent_id: summary.agent_id,
            connection_id: summary.connection_id,
            platform: summary.platform,
            connected_at: summary.connected_at,
            last_heartbeat: summary.last_heartbeat,
        }
    }
}

/// Connected agents
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AgentList {
    pub agents: Vec<AgentInfo>,
    pub total: usize,
}

/// An active VNC relay
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RelayInfo {
    pub relay_id: Uuid,
    pub session_id: String,
    pub user_id: String,
    pub agent_id: String,
    /// Lifecycle state (connecting, active, closing, closed)
    pub state: String,
    pub started_at: DateTime<Utc>,
}

impl From<&RelayHandle> for RelayInfo {
    fn from(handle: &RelayHandle) -> Self {
        Self {
            relay_id: handle.relay_id(),
            session_id: handle.session_id().to_string(),
            user_id: handle.user_id().to_string(),
            agent_id: handle.agent_id().to_string(),
            state: handle.state().as_str().to_string(),
            started_at: handle.started_at(),
        }
    }
}

/// Active VNC relays visible to the caller
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RelayList {
    pub relays: Vec<RelayInfo>,
    /// Relays visible to the caller
    pub total: usize,
}

/// Query parameters of the agent tunnel endpoint
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AgentConnectQuery {
    /// Agent identifier
    pub agent_id: String,
    /// Platform the agent runs on
    #[serde(default)]
    pub platform: Option<String>,
}
