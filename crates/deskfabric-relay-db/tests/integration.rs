//! Integration tests for deskfabric-relay-db
//!
//! Tests database operations with real SQLite in-memory database

use chrono::Utc;
use deskfabric_relay_db::entities::session::{self, SessionState};
use deskfabric_relay_db::{connect, migrate};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter, Set,
};

/// Helper to create a test database
async fn setup_test_db() -> sea_orm::DatabaseConnection {
    let db = connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");

    migrate(&db).await.expect("Failed to run migrations");

    db
}

fn new_session(id: &str, user: &str, agent: Option<&str>, state: SessionState) -> session::ActiveModel {
    let now = Utc::now();
    session::ActiveModel {
        id: Set(id.to_string()),
        user_id: Set(user.to_string()),
        agent_id: Set(agent.map(str::to_string)),
        state: Set(state),
        active_connections: Set(0),
        last_connection: Set(None),
        last_disconnect: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

#[tokio::test]
async fn test_database_connection() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    let backend = db.get_database_backend();
    assert!(matches!(backend, sea_orm::DatabaseBackend::Sqlite));
}

#[tokio::test]
async fn test_migrations_run_successfully() {
    let db = connect("sqlite::memory:").await.expect("Failed to connect");

    assert!(migrate(&db).await.is_ok());
    // Running twice is a no-op
    assert!(migrate(&db).await.is_ok());
}

#[tokio::test]
async fn test_create_and_read_session() {
    let db = setup_test_db().await;

    new_session("sess-1", "user-1", Some("agent-a"), SessionState::Running)
        .insert(&db)
        .await
        .expect("insert");

    let found = session::Entity::find_by_id("sess-1".to_string())
        .one(&db)
        .await
        .expect("query")
        .expect("row exists");

    assert_eq!(found.user_id, "user-1");
    assert_eq!(found.agent_id.as_deref(), Some("agent-a"));
    assert_eq!(found.state, SessionState::Running);
    assert_eq!(found.active_connections, 0);
    assert!(found.last_connection.is_none());
}

#[tokio::test]
async fn test_unclaimed_session_has_no_agent() {
    let db = setup_test_db().await;

    new_session("sess-2", "user-1", None, SessionState::Pending)
        .insert(&db)
        .await
        .expect("insert");

    let found = session::Entity::find_by_id("sess-2".to_string())
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.agent_id, None);
    assert_eq!(found.state, SessionState::Pending);
}

#[tokio::test]
async fn test_guarded_decrement_never_goes_negative() {
    let db = setup_test_db().await;

    new_session("sess-3", "user-1", Some("agent-a"), SessionState::Running)
        .insert(&db)
        .await
        .unwrap();

    // Same guarded statement the relay issues on teardown
    let result = session::Entity::update_many()
        .col_expr(
            session::Column::ActiveConnections,
            Expr::col(session::Column::ActiveConnections).sub(1),
        )
        .filter(session::Column::Id.eq("sess-3"))
        .filter(session::Column::ActiveConnections.gt(0))
        .exec(&db)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 0);

    let found = session::Entity::find_by_id("sess-3".to_string())
        .one(&db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.active_connections, 0);
}

#[tokio::test]
async fn test_filter_sessions_by_agent() {
    let db = setup_test_db().await;

    for (id, agent) in [("a1", "agent-a"), ("a2", "agent-a"), ("b1", "agent-b")] {
        new_session(id, "user-1", Some(agent), SessionState::Running)
            .insert(&db)
            .await
            .unwrap();
    }

    let count = session::Entity::find()
        .filter(session::Column::AgentId.eq("agent-a"))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(count, 2);
}
