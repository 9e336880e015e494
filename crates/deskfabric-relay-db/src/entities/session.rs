//! Session entity
//!
//! Rows are created and advanced by the session lifecycle owner. The relay
//! only reads `user_id`, `agent_id` and `state`, and writes the connection
//! counter and its two timestamps.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Waiting for an agent to claim and schedule the pod
    #[sea_orm(string_value = "pending")]
    Pending,

    /// Pod running and reachable through its agent
    #[sea_orm(string_value = "running")]
    Running,

    /// Scaled to zero, wake before connecting
    #[sea_orm(string_value = "hibernated")]
    Hibernated,

    #[sea_orm(string_value = "terminated")]
    Terminated,

    #[sea_orm(string_value = "failed")]
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "pending",
            SessionState::Running => "running",
            SessionState::Hibernated => "hibernated",
            SessionState::Terminated => "terminated",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Owner
    pub user_id: String,

    /// Agent that claimed the session, if any
    #[sea_orm(nullable)]
    pub agent_id: Option<String>,

    pub state: SessionState,

    /// Number of VNC clients currently attached, never negative
    pub active_connections: i32,

    pub last_connection: Option<ChronoDateTimeUtc>,

    pub last_disconnect: Option<ChronoDateTimeUtc>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
