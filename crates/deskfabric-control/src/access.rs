//! Session access decisions

use async_trait::async_trait;

use crate::directory::SessionRecord;

/// Decides whether a user may attach to a session they do not necessarily own
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn can_access(&self, user_id: &str, session: &SessionRecord) -> bool;
}

/// Only the session owner may connect
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOnly;

#[async_trait]
impl AccessPolicy for OwnerOnly {
    async fn can_access(&self, user_id: &str, session: &SessionRecord) -> bool {
        !user_id.is_empty() && session.user_id == user_id
    }
}
