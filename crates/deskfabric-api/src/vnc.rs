//! Client-facing VNC endpoint
//!
//! Every routing precondition is checked before the WebSocket upgrade, so a
//! rejected client gets a plain HTTP status with a JSON body instead of a
//! socket that opens and immediately closes.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use deskfabric_control::RelayError;
use tracing::{debug, error, info, warn};

use crate::middleware::AuthUser;
use crate::models::ErrorResponse;
use crate::transport::WsClientTransport;
use crate::AppState;

/// HTTP status for a relay precondition failure
pub fn relay_error_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        RelayError::Forbidden => StatusCode::FORBIDDEN,
        RelayError::Conflict(_) => StatusCode::CONFLICT,
        RelayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Directory(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn relay_error_response(err: &RelayError) -> (StatusCode, Json<ErrorResponse>) {
    let status = relay_error_status(err);
    // Collaborator failures are not the caller's business
    let message = match err {
        RelayError::Directory(_) => "Internal server error".to_string(),
        other => other.to_string(),
    };
    (status, Json(ErrorResponse::new(message, err.code())))
}

/// Open a VNC relay to a session
#[utoipa::path(
    get,
    path = "/api/v1/vnc/{session_id}",
    params(
        ("session_id" = String, Path, description = "Session identifier")
    ),
    responses(
        (status = 101, description = "Switching to WebSocket; binary frames carry the VNC stream"),
        (status = 400, description = "Invalid session id", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Session belongs to another user", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session is not running", body = ErrorResponse),
        (status = 503, description = "Agent unavailable", body = ErrorResponse),
        (status = 500, description = "Session directory failure", body = ErrorResponse)
    ),
    tag = "vnc"
)]
pub async fn vnc_proxy(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Extension(user): Extension<AuthUser>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ticket = match state.relay.authorize(&session_id, &user.user_id).await {
        Ok(ticket) => ticket,
        Err(e) => {
            match &e {
                RelayError::Directory(inner) => {
                    error!(session_id = %session_id, "Session lookup failed: {}", inner)
                }
                other => {
                    debug!(session_id = %session_id, user_id = %user.user_id, "VNC relay rejected: {}", other)
                }
            }
            return relay_error_response(&e).into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(session_id = %session_id, "VNC request is not a WebSocket upgrade: {}", rejection);
            return rejection.into_response();
        }
    };

    info!(
        session_id = %ticket.session_id(),
        user_id = %ticket.user_id(),
        agent_id = %ticket.agent_id(),
        "Upgrading VNC connection"
    );

    let relay = state.relay.clone();
    let max_frame_size = state.max_frame_size;
    ws.max_message_size(max_frame_size)
        .on_upgrade(move |socket| async move {
            let handle = relay.start(ticket, WsClientTransport::new(socket, max_frame_size));
            handle.wait_closed().await;
        })
}
