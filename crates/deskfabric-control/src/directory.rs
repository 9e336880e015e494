//! Session directory: the relay's read/write view of session rows
//!
//! The relay reads a session's owner, agent and state once at connect time,
//! then only touches the connection counter and its timestamps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use deskfabric_relay_db::entities::session::{self, SessionState};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use thiserror::Error;
use tracing::debug;

/// Session directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Session directory unavailable: {0}")]
    Unavailable(String),
}

/// The fields the relay needs to route a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub state: SessionState,
}

impl From<session::Model> for SessionRecord {
    fn from(model: session::Model) -> Self {
        Self {
            session_id: model.id,
            user_id: model.user_id,
            agent_id: model.agent_id,
            state: model.state,
        }
    }
}

/// Connection bookkeeping for a session
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectionCounters {
    pub active_connections: i32,
    pub last_connection: Option<DateTime<Utc>>,
    pub last_disconnect: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError>;

    /// Increment `active_connections` and stamp `last_connection`
    async fn record_connect(&self, session_id: &str, at: DateTime<Utc>)
        -> Result<(), DirectoryError>;

    /// Decrement `active_connections` (never below zero) and stamp `last_disconnect`
    async fn record_disconnect(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone)]
struct SessionEntry {
    record: SessionRecord,
    counters: ConnectionCounters,
}

/// Directory backed by process memory, for single-node setups and tests
#[derive(Debug, Default)]
pub struct InMemorySessionDirectory {
    sessions: DashMap<String, SessionEntry>,
}

impl InMemorySessionDirectory {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert or replace a session, keeping its counters if it already existed
    pub fn upsert(&self, record: SessionRecord) {
        let session_id = record.session_id.clone();
        self.sessions
            .entry(session_id)
            .and_modify(|entry| entry.record = record.clone())
            .or_insert_with(|| SessionEntry {
                record,
                counters: ConnectionCounters::default(),
            });
    }

    pub fn set_state(&self, session_id: &str, state: SessionState) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.record.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.remove(session_id).map(|(_, entry)| entry.record)
    }

    pub fn counters(&self, session_id: &str) -> Option<ConnectionCounters> {
        self.sessions.get(session_id).map(|entry| entry.counters)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionDirectory for InMemorySessionDirectory {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        Ok(self.sessions.get(session_id).map(|entry| entry.record.clone()))
    }

    async fn record_connect(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.counters.active_connections += 1;
            entry.counters.last_connection = Some(at);
        }
        Ok(())
    }

    async fn record_disconnect(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            if entry.counters.active_connections > 0 {
                entry.counters.active_connections -= 1;
            }
            entry.counters.last_disconnect = Some(at);
        }
        Ok(())
    }
}

/// Directory backed by the `sessions` table
#[derive(Debug, Clone)]
pub struct DbSessionDirectory {
    db: DatabaseConnection,
}

impl DbSessionDirectory {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn counters(&self, session_id: &str) -> Result<Option<ConnectionCounters>, DirectoryError> {
        let model = session::Entity::find_by_id(session_id.to_string())
            .one(&self.db)
            .await?;
        Ok(model.map(|m| ConnectionCounters {
            active_connections: m.active_connections,
            last_connection: m.last_connection,
            last_disconnect: m.last_disconnect,
        }))
    }
}

#[async_trait]
impl SessionDirectory for DbSessionDirectory {
    async fn lookup(&self, session_id: &str) -> Result<Option<SessionRecord>, DirectoryError> {
        let model = session::Entity::find_by_id(session_id.to_string())
            .one(&self.db)
            .await?;
        Ok(model.map(SessionRecord::from))
    }

    async fn record_connect(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        session::Entity::update_many()
            .col_expr(
                session::Column::ActiveConnections,
                Expr::col(session::Column::ActiveConnections).add(1),
            )
            .col_expr(session::Column::LastConnection, Expr::value(at))
            .col_expr(session::Column::UpdatedAt, Expr::value(at))
            .filter(session::Column::Id.eq(session_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn record_disconnect(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let result = session::Entity::update_many()
            .col_expr(
                session::Column::ActiveConnections,
                Expr::col(session::Column::ActiveConnections).sub(1),
            )
            .col_expr(session::Column::LastDisconnect, Expr::value(at))
            .col_expr(session::Column::UpdatedAt, Expr::value(at))
            .filter(session::Column::Id.eq(session_id))
            .filter(session::Column::ActiveConnections.gt(0))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Counter already at zero; still record when the client left
            debug!(session_id = %session_id, "Connection counter already zero");
            session::Entity::update_many()
                .col_expr(session::Column::LastDisconnect, Expr::value(at))
                .col_expr(session::Column::UpdatedAt, Expr::value(at))
                .filter(session::Column::Id.eq(session_id))
                .exec(&self.db)
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            user_id: "user-1".to_string(),
            agent_id: Some("agent-1".to_string()),
            state: SessionState::Running,
        }
    }

    #[tokio::test]
    async fn test_in_memory_lookup() {
        let dir = InMemorySessionDirectory::new();
        dir.upsert(record("sess-1"));

        assert_eq!(dir.lookup("sess-1").await.unwrap(), Some(record("sess-1")));
        assert_eq!(dir.lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_counter_never_negative() {
        let dir = InMemorySessionDirectory::new();
        dir.upsert(record("sess-1"));
        let now = Utc::now();

        dir.record_connect("sess-1", now).await.unwrap();
        dir.record_disconnect("sess-1", now).await.unwrap();
        dir.record_disconnect("sess-1", now).await.unwrap();

        let counters = dir.counters("sess-1").unwrap();
        assert_eq!(counters.active_connections, 0);
        assert_eq!(counters.last_connection, Some(now));
        assert_eq!(counters.last_disconnect, Some(now));
    }

    #[tokio::test]
    async fn test_upsert_keeps_counters() {
        let dir = InMemorySessionDirectory::new();
        dir.upsert(record("sess-1"));
        dir.record_connect("sess-1", Utc::now()).await.unwrap();

        let mut updated = record("sess-1");
        updated.state = SessionState::Hibernated;
        dir.upsert(updated);

        assert_eq!(dir.counters("sess-1").unwrap().active_connections, 1);
        assert_eq!(
            dir.lookup("sess-1").await.unwrap().unwrap().state,
            SessionState::Hibernated
        );
    }

    #[tokio::test]
    async fn test_unknown_session_writes_are_ignored() {
        let dir = InMemorySessionDirectory::new();
        dir.record_connect("ghost", Utc::now()).await.unwrap();
        assert!(dir.counters("ghost").is_none());
        assert!(dir.is_empty());
    }
}
