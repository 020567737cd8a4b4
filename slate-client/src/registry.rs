//! Process-wide session cache, keyed by room id.
//!
//! Multiple local consumers attaching to the same room share one session
//! and therefore one socket, instead of each opening a redundant relay
//! connection. The cache is an explicit value with an injected lifetime;
//! construct one per process and pass it around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use slate_core::DurableQueue;

use crate::session::{SyncConfig, SyncSession};

/// Cache of live sessions, one per room.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SyncSession>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.lock().len())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the room in `config`: adopt the existing live session if
    /// one is cached, otherwise spawn a new one.
    ///
    /// Liveness is checked at attach time, not insert time, so a session
    /// that since closed is replaced rather than handed out dead.
    pub fn attach(&self, config: SyncConfig, queue: Arc<dyn DurableQueue>) -> SyncSession {
        let mut sessions = self.lock();
        if let Some(existing) = sessions.get(&config.room_id) {
            if existing.is_live() {
                tracing::debug!(room = %config.room_id, "adopting cached session");
                return existing.clone();
            }
        }

        let session = SyncSession::spawn(config, queue);
        sessions.insert(session.room_id().to_string(), session.clone());
        session
    }

    /// The cached session for a room, if it is still live.
    #[must_use]
    pub fn get(&self, room_id: &str) -> Option<SyncSession> {
        self.lock()
            .get(room_id)
            .filter(|session| session.is_live())
            .cloned()
    }

    /// Close and evict the session for a room, if any.
    pub fn detach(&self, room_id: &str) {
        if let Some(session) = self.lock().remove(room_id) {
            session.close();
        }
    }

    /// Close and evict every cached session.
    pub fn close_all(&self) {
        for (_, session) in self.lock().drain() {
            session.close();
        }
    }

    /// Number of cached sessions, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SessionStatus;
    use slate_core::MemoryQueue;
    use std::time::Duration;

    fn disabled_config(room: &str) -> SyncConfig {
        // An empty server is never dialed for these tests; the sessions
        // stay in their initial state.
        SyncConfig::new("ws://127.0.0.1:1/ws", room, "alice")
    }

    fn queue() -> Arc<dyn DurableQueue> {
        Arc::new(MemoryQueue::new())
    }

    #[tokio::test]
    async fn same_room_adopts_the_cached_session() {
        let registry = SessionRegistry::new();
        let a = registry.attach(disabled_config(""), queue());
        let b = registry.attach(disabled_config(""), queue());

        assert_eq!(registry.len(), 1);
        // Both handles drive the same underlying doc.
        assert_eq!(a.status(), SessionStatus::Disabled);
        assert_eq!(b.status(), SessionStatus::Disabled);
        registry.close_all();
    }

    #[tokio::test]
    async fn closed_sessions_are_replaced_not_adopted() {
        let registry = SessionRegistry::new();
        let first = registry.attach(disabled_config(""), queue());
        first.close();

        // Wait for the driver to wind down.
        let mut status = first.status_stream();
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while *status.borrow() != SessionStatus::Disconnected {
                if status.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        let second = registry.attach(disabled_config(""), queue());
        assert!(second.is_live());
        assert_eq!(registry.len(), 1);
        registry.close_all();
    }

    #[tokio::test]
    async fn different_rooms_get_different_sessions() {
        let registry = SessionRegistry::new();
        let _a = registry.attach(disabled_config(""), queue());
        // Distinct key, even though it will never connect anywhere.
        let mut config = disabled_config("");
        config.room_id = "other".into();
        let b = registry.attach(config, queue());

        assert_eq!(registry.len(), 2);
        assert_eq!(b.room_id(), "other");
        registry.close_all();
    }
}
