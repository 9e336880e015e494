//! HTTP and WebSocket surface of the control plane
//!
//! - `GET /api/v1/agents/connect`: agents dial in and keep their tunnel open
//! - `GET /api/v1/vnc/{session_id}`: clients open a VNC relay (JWT protected)
//! - REST endpoints for health and introspection, documented with OpenAPI

pub mod agent_tunnel;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod transport;
pub mod vnc;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use deskfabric_control::{AgentHub, QueueConfig, SessionRelay};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use agent_tunnel::{AgentTunnelConfig, AGENT_KEY_HEADER};
pub use transport::WsClientTransport;

/// Default cap on a single client frame (256 KiB). Base64 inflates frames by
/// a third on the agent tunnel, so this keeps envelopes under their limit.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Largest client frame whose base64 envelope still fits `MAX_ENVELOPE_SIZE`,
/// leaving 4 KiB for the JSON wrapper
pub const MAX_FRAME_SIZE_LIMIT: usize =
    deskfabric_proto::MAX_ENVELOPE_SIZE / 4 * 3 - 4 * 1024;

/// Application state shared across handlers
pub struct AppState {
    pub relay: SessionRelay,
    pub hub: Arc<AgentHub>,
    /// Shared key agents must present, if configured
    pub agent_key: Option<String>,
    pub queues: QueueConfig,
    pub tunnel: AgentTunnelConfig,
    pub max_frame_size: usize,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Deskfabric API",
        version = "0.1.0",
        description = "Control plane for remote desktop sessions relayed through cluster agents"
    ),
    paths(
        handlers::health_check,
        handlers::list_agents,
        handlers::list_relays,
        handlers::close_relay,
        vnc::vnc_proxy,
        agent_tunnel::agent_connect,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::ErrorResponse,
            models::AgentInfo,
            models::AgentList,
            models::RelayInfo,
            models::RelayList,
        )
    ),
    tags(
        (name = "vnc", description = "VNC relay endpoints"),
        (name = "agents", description = "Agent tunnel endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for development)
    pub enable_cors: bool,
    /// Allowed CORS origins (if None, localhost origins are allowed)
    pub cors_origins: Option<Vec<String>>,
    /// Secret used to validate client access tokens
    pub jwt_secret: String,
    pub agent_key: Option<String>,
    pub queues: QueueConfig,
    pub tunnel: AgentTunnelConfig,
    pub max_frame_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
            cors_origins: None,
            jwt_secret: String::new(),
            agent_key: None,
            queues: QueueConfig::default(),
            tunnel: AgentTunnelConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, relay: SessionRelay) -> Self {
        let state = Arc::new(AppState {
            hub: relay.hub().clone(),
            relay,
            agent_key: config.agent_key.clone(),
            queues: config.queues,
            tunnel: config.tunnel,
            max_frame_size: config.max_frame_size,
        });

        Self { config, state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let jwt_state = Arc::new(middleware::JwtState::new(
            self.config.jwt_secret.as_bytes(),
        ));

        // Agents authenticate with the shared key inside the handler
        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/v1/agents/connect", get(agent_tunnel::agent_connect))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route("/api/v1/vnc/{session_id}", get(vnc::vnc_proxy))
            .route("/api/v1/agents", get(handlers::list_agents))
            .route("/api/v1/relays", get(handlers::list_relays))
            .route(
                "/api/v1/relays/{session_id}",
                axum::routing::delete(handlers::close_relay),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ));

        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(public_router)
            .merge(protected_router);

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            router = router.layer(self.cors_layer());
        }

        router
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins = match &self.config.cors_origins {
            Some(list) => AllowOrigin::list(
                list.iter()
                    .filter_map(|origin| HeaderValue::from_str(origin).ok()),
            ),
            None => AllowOrigin::predicate(|origin: &HeaderValue, _| {
                let origin_str = origin.to_str().unwrap_or("");
                origin_str.starts_with("http://localhost:")
                    || origin_str.starts_with("http://127.0.0.1:")
                    || origin_str.starts_with("https://localhost:")
                    || origin_str.starts_with("https://127.0.0.1:")
            }),
        };

        CorsLayer::new()
            .allow_methods([Method::GET, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_origin(origins)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn start(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let router = self.build_router();
        let addr = listener.local_addr()?;

        info!("Starting API server on {}", addr);
        info!("OpenAPI spec: http://{}/api/openapi.json", addr);
        info!("Swagger UI: http://{}/swagger-ui", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits_fit_envelope() {
        assert!(DEFAULT_MAX_FRAME_SIZE <= MAX_FRAME_SIZE_LIMIT);
        assert!(MAX_FRAME_SIZE_LIMIT.div_ceil(3) * 4 < deskfabric_proto::MAX_ENVELOPE_SIZE);
    }

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().unwrap();
        assert!(json.contains("/api/v1/vnc/{session_id}"));
        assert!(json.contains("/api/v1/agents/connect"));
    }
}
