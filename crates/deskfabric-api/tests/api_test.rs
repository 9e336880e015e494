//! HTTP-level tests for the API router
//!
//! Requests go through the full router (auth middleware included) with
//! `tower::ServiceExt::oneshot`; no socket is opened.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Duration;
use deskfabric_api::models::{AgentList, ErrorResponse, HealthResponse, RelayList};
use deskfabric_api::{ApiServer, ApiServerConfig};
use deskfabric_auth::{JwtClaims, JwtValidator};
use deskfabric_control::{
    AgentConnection, AgentHub, InMemorySessionDirectory, QueueConfig, SessionRecord, SessionRelay,
    SessionState,
};
use std::sync::Arc;
use tower::ServiceExt;

const SECRET: &str = "api-test-secret";

struct TestApp {
    router: Router,
    hub: Arc<AgentHub>,
    relay: SessionRelay,
}

fn session(id: &str, owner: &str, agent: Option<&str>, state: SessionState) -> SessionRecord {
    SessionRecord {
        session_id: id.to_string(),
        user_id: owner.to_string(),
        agent_id: agent.map(str::to_string),
        state,
    }
}

fn create_test_app(agent_key: Option<&str>) -> TestApp {
    let hub = Arc::new(AgentHub::new());
    let directory = Arc::new(InMemorySessionDirectory::new());

    directory.upsert(session("sess-ok", "alice", Some("agent-1"), SessionState::Running));
    directory.upsert(session("sess-asleep", "alice", Some("agent-1"), SessionState::Hibernated));
    directory.upsert(session("sess-unclaimed", "alice", None, SessionState::Running));
    directory.upsert(session("sess-offline", "alice", Some("agent-9"), SessionState::Running));

    let relay = SessionRelay::new(hub.clone(), directory);
    let config = ApiServerConfig {
        jwt_secret: SECRET.to_string(),
        agent_key: agent_key.map(str::to_string),
        ..Default::default()
    };
    let server = ApiServer::new(config, relay.clone());

    TestApp {
        router: server.build_router(),
        hub,
        relay,
    }
}

fn token_for(user_id: &str, role: &str) -> String {
    let claims = JwtClaims::new(
        user_id.to_string(),
        "deskfabric".to_string(),
        Duration::hours(1),
    )
    .with_role(role.to_string());
    JwtValidator::encode(SECRET.as_bytes(), &claims).unwrap()
}

fn connect_agent(hub: &AgentHub, agent_id: &str) -> Arc<AgentConnection> {
    let conn = Arc::new(AgentConnection::new(agent_id, "kubernetes", QueueConfig::default()));
    hub.register(conn.clone()).unwrap();
    conn
}

async fn get(router: &Router, uri: &str, token: Option<&str>) -> Response {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = create_test_app(None);
    connect_agent(&app.hub, "agent-1");

    let response = get(&app.router, "/api/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = json(response).await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.connected_agents, 1);
    assert_eq!(health.active_relays, 0);
}

#[tokio::test]
async fn test_vnc_requires_token() {
    let app = create_test_app(None);

    let response = get(&app.router, "/api/v1/vnc/sess-ok", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_vnc_precondition_statuses() {
    let app = create_test_app(None);
    connect_agent(&app.hub, "agent-1");
    let alice = token_for("alice", "user");
    let mallory = token_for("mallory", "user");

    let cases = [
        ("/api/v1/vnc/bad%20id", &alice, StatusCode::BAD_REQUEST, "invalid_session_id"),
        ("/api/v1/vnc/sess-missing", &alice, StatusCode::NOT_FOUND, "session_not_found"),
        ("/api/v1/vnc/sess-ok", &mallory, StatusCode::FORBIDDEN, "forbidden"),
        ("/api/v1/vnc/sess-asleep", &alice, StatusCode::CONFLICT, "session_not_running"),
        ("/api/v1/vnc/sess-unclaimed", &alice, StatusCode::SERVICE_UNAVAILABLE, "agent_unavailable"),
        ("/api/v1/vnc/sess-offline", &alice, StatusCode::SERVICE_UNAVAILABLE, "agent_unavailable"),
    ];

    for (uri, token, status, code) in cases {
        let response = get(&app.router, uri, Some(token)).await;
        assert_eq!(response.status(), status, "{}", uri);

        let error: ErrorResponse = json(response).await;
        assert_eq!(error.code.as_deref(), Some(code), "{}", uri);
    }

    assert_eq!(app.relay.active_count(), 0);
}

#[tokio::test]
async fn test_vnc_conflict_message_names_state() {
    let app = create_test_app(None);
    let alice = token_for("alice", "user");

    let response = get(&app.router, "/api/v1/vnc/sess-asleep", Some(&alice)).await;
    let error: ErrorResponse = json(response).await;
    assert_eq!(error.error, "Session is not running (state: hibernated)");
}

#[tokio::test]
async fn test_vnc_token_in_query_parameter() {
    let app = create_test_app(None);
    let alice = token_for("alice", "user");

    let response = get(
        &app.router,
        &format!("/api/v1/vnc/sess-missing?token={}", alice),
        None,
    )
    .await;

    // Past authentication, rejected by the session lookup
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_vnc_plain_request_is_not_upgraded() {
    let app = create_test_app(None);
    connect_agent(&app.hub, "agent-1");
    let alice = token_for("alice", "user");

    let response = get(&app.router, "/api/v1/vnc/sess-ok", Some(&alice)).await;

    assert!(response.status().is_client_error());
    assert_eq!(app.relay.active_count(), 0);
}

#[tokio::test]
async fn test_list_agents() {
    let app = create_test_app(None);
    connect_agent(&app.hub, "agent-b");
    connect_agent(&app.hub, "agent-a");
    let alice = token_for("alice", "user");

    let response = get(&app.router, "/api/v1/agents", Some(&alice)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let list: AgentList = json(response).await;
    assert_eq!(list.total, 2);
    let ids: Vec<&str> = list.agents.iter().map(|a| a.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["agent-a", "agent-b"]);
    assert_eq!(list.agents[0].platform, "kubernetes");
}

#[tokio::test]
async fn test_list_relays_empty() {
    let app = create_test_app(None);
    let admin = token_for("root", "admin");

    let response = get(&app.router, "/api/v1/relays", Some(&admin)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let list: RelayList = json(response).await;
    assert_eq!(list.total, 0);
}

#[tokio::test]
async fn test_close_unknown_relay() {
    let app = create_test_app(None);
    let alice = token_for("alice", "user");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/relays/sess-ok")
                .header("Authorization", format!("Bearer {}", alice))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_connect_requires_agent_id() {
    let app = create_test_app(None);

    let response = get(&app.router, "/api/v1/agents/connect?agent_id=", None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let error: ErrorResponse = json(response).await;
    assert_eq!(error.code.as_deref(), Some("MISSING_AGENT_ID"));
}

#[tokio::test]
async fn test_agent_connect_rejects_wrong_key() {
    let app = create_test_app(Some("agent-secret"));

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/agents/connect?agent_id=agent-1")
                .header("X-Agent-Key", "guess")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.hub.count(), 0);
}

#[tokio::test]
async fn test_openapi_served() {
    let app = create_test_app(None);

    let response = get(&app.router, "/api/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);
}
