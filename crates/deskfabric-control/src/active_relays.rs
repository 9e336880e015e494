//! Tracks the single active relay per session
//!
//! Installing a relay for a session that already has one closes the old
//! relay: the most recent client wins.

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::relay_handle::{CloseReason, RelayHandle};

/// Map of session id -> running relay
#[derive(Debug, Default)]
pub struct ActiveRelays {
    relays: DashMap<String, RelayHandle>,
}

impl ActiveRelays {
    pub fn new() -> Self {
        Self {
            relays: DashMap::new(),
        }
    }

    /// Install a relay, closing and returning the one it replaces
    pub fn install(&self, handle: RelayHandle) -> Option<RelayHandle> {
        let previous = self
            .relays
            .insert(handle.session_id().to_string(), handle.clone());

        if let Some(ref old) = previous {
            if !old.same_relay(&handle) {
                info!(
                    session_id = %handle.session_id(),
                    old_relay_id = %old.relay_id(),
                    new_relay_id = %handle.relay_id(),
                    "Superseding existing VNC relay"
                );
                old.close(CloseReason::Superseded);
            }
        }

        previous
    }

    /// Remove the entry only if it still belongs to `relay_id`
    pub fn remove_if_current(&self, session_id: &str, relay_id: Uuid) -> bool {
        let removed = self
            .relays
            .remove_if(session_id, |_, handle| handle.relay_id() == relay_id)
            .is_some();

        if removed {
            debug!(session_id = %session_id, relay_id = %relay_id, "Relay entry removed");
        }

        removed
    }

    pub fn get(&self, session_id: &str) -> Option<RelayHandle> {
        self.relays.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.relays.contains_key(session_id)
    }

    pub fn count(&self) -> usize {
        self.relays.len()
    }

    pub fn handles(&self) -> Vec<RelayHandle> {
        self.relays.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Close the relay for one session. Its own teardown removes the entry.
    pub fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        match self.get(session_id) {
            Some(handle) => handle.close(reason),
            None => false,
        }
    }

    /// Close every relay, returning how many were asked to close
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.handles()
            .into_iter()
            .filter(|handle| handle.close(reason))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_handle::RelayState;

    fn handle(session_id: &str) -> RelayHandle {
        RelayHandle::new(session_id.into(), "user-1".into(), "agent-1".into())
    }

    #[test]
    fn test_install_and_remove() {
        let relays = ActiveRelays::new();
        let relay = handle("sess-1");

        assert!(relays.install(relay.clone()).is_none());
        assert!(relays.is_active("sess-1"));
        assert_eq!(relays.count(), 1);

        assert!(relays.remove_if_current("sess-1", relay.relay_id()));
        assert!(!relays.is_active("sess-1"));
    }

    #[test]
    fn test_install_supersedes_previous() {
        let relays = ActiveRelays::new();
        let first = handle("sess-1");
        let second = handle("sess-1");
        first.activate();
        second.activate();

        relays.install(first.clone());
        let replaced = relays.install(second.clone()).unwrap();

        assert_eq!(replaced.relay_id(), first.relay_id());
        assert_eq!(first.state(), RelayState::Closing);
        assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
        assert_eq!(second.state(), RelayState::Active);
        assert_eq!(relays.count(), 1);
    }

    #[test]
    fn test_superseded_relay_cannot_remove_successor() {
        let relays = ActiveRelays::new();
        let first = handle("sess-1");
        let second = handle("sess-1");

        relays.install(first.clone());
        relays.install(second.clone());

        assert!(!relays.remove_if_current("sess-1", first.relay_id()));
        assert_eq!(
            relays.get("sess-1").unwrap().relay_id(),
            second.relay_id()
        );
    }

    #[test]
    fn test_close_all() {
        let relays = ActiveRelays::new();
        for id in ["a", "b", "c"] {
            let relay = handle(id);
            relay.activate();
            relays.install(relay);
        }

        assert_eq!(relays.close_all(CloseReason::Shutdown), 3);
        assert!(relays
            .handles()
            .iter()
            .all(|h| h.close_reason() == Some(CloseReason::Shutdown)));
        // Already closing
        assert_eq!(relays.close_all(CloseReason::Shutdown), 0);
    }
}
