//! REST handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use tracing::{debug, info};

use crate::middleware::AuthUser;
use crate::models::{AgentInfo, AgentList, ErrorResponse, HealthResponse, RelayInfo, RelayList};
use crate::AppState;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_agents: state.hub.count(),
        active_relays: state.relay.active_count(),
    })
}

/// List connected agents
#[utoipa::path(
    get,
    path = "/api/v1/agents",
    responses(
        (status = 200, description = "Connected agents", body = AgentList),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentList> {
    let agents: Vec<AgentInfo> = state
        .hub
        .connected_agents()
        .into_iter()
        .map(AgentInfo::from)
        .collect();

    debug!(count = agents.len(), "Listing agents");

    Json(AgentList {
        total: agents.len(),
        agents,
    })
}

/// List active VNC relays
///
/// Admins see every relay; other users see only their own.
#[utoipa::path(
    get,
    path = "/api/v1/relays",
    responses(
        (status = 200, description = "Active relays", body = RelayList),
        (status = 401, description = "Unauthorized", body = ErrorResponse)
    ),
    tag = "vnc"
)]
pub async fn list_relays(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<RelayList> {
    let mut relays: Vec<RelayInfo> = state
        .relay
        .active_relays()
        .handles()
        .iter()
        .filter(|handle| user.is_admin() || handle.user_id() == user.user_id)
        .map(RelayInfo::from)
        .collect();
    relays.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    Json(RelayList {
        total: relays.len(),
        relays,
    })
}

/// Close the active relay of a session
#[utoipa::path(
    delete,
    path = "/api/v1/relays/{session_id}",
    params(
        ("session_id" = String, Path, description = "Session identifier")
    ),
    responses(
        (status = 204, description = "Relay closing"),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 403, description = "Relay belongs to another user", body = ErrorResponse),
        (status = 404, description = "No active relay for this session", body = ErrorResponse)
    ),
    tag = "vnc"
)]
pub async fn close_relay(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Extension(user): Extension<AuthUser>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let handle = state.relay.active_relays().get(&session_id).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                format!("No active relay for session {}", session_id),
                "relay_not_found",
            )),
        )
    })?;

    if !user.is_admin() && handle.user_id() != user.user_id {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Access denied", "forbidden")),
        ));
    }

    state.relay.close_session(&session_id);
    info!(session_id = %session_id, user_id = %user.user_id, "Relay closed via API");

    Ok(StatusCode::NO_CONTENT)
}
