//! Session registry: at most one session per peer location.
//!
//! The [`SessionManager`] tracks established sessions, sessions still being
//! dialled, which connection carries which session, and the peer key behind
//! each live session ID for handoff verification.

#![warn(missing_docs)]

use crate::connection::ConnectionId;
use crate::crypto::PublicKey;
use crate::error::{WireError, WireResult};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::oneshot;
use tracing::debug;

/// Settlement of a pending session: the session, or why it failed.
pub type SessionWaiter = oneshot::Receiver<Result<Arc<Session>, String>>;

struct PendingSession {
    outgoing: ConnectionId,
    waiters: Vec<oneshot::Sender<Result<Arc<Session>, String>>>,
}

impl PendingSession {
    fn settle(self, result: Result<Arc<Session>, String>) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[derive(Default)]
struct Tables {
    active: HashMap<String, Arc<Session>>,
    pending: HashMap<String, PendingSession>,
    by_connection: HashMap<ConnectionId, Arc<Session>>,
    peer_keys: HashMap<String, PublicKey>,
}

/// What `provide` found for a location.
pub enum Provided {
    /// Already established.
    Active(Arc<Session>),
    /// Someone is already dialling; wait for them.
    Pending(SessionWaiter),
    /// Caller must dial using the connection ID it passed.
    Dial(SessionWaiter),
}

/// Thread-safe session registry.
#[derive(Clone, Default)]
pub struct SessionManager {
    tables: Arc<RwLock<Tables>>,
}

impl SessionManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The established session with `location_id`, if any.
    pub fn active_session(&self, location_id: &str) -> Option<Arc<Session>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.active.get(location_id).cloned()
    }

    /// Every established session.
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.active.values().cloned().collect()
    }

    /// Number of established sessions.
    pub fn active_count(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.active.len()
    }

    /// The session carried by `connection`, once its handshake is done.
    pub fn session_for_connection(&self, connection: ConnectionId) -> Option<Arc<Session>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_connection.get(&connection).cloned()
    }

    /// The connection we are dialling `location_id` on, if any.
    pub fn outgoing_connection(&self, location_id: &str) -> Option<ConnectionId> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.pending.get(location_id).map(|p| p.outgoing)
    }

    /// Record that `outgoing` is dialling `location_id`.
    pub fn make_pending_session(&self, location_id: &str, outgoing: ConnectionId) -> WireResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.active.contains_key(location_id) || tables.pending.contains_key(location_id) {
            return Err(WireError::SessionExists(location_id.to_string()));
        }
        tables.pending.insert(
            location_id.to_string(),
            PendingSession {
                outgoing,
                waiters: Vec::new(),
            },
        );
        Ok(())
    }

    /// Wait on the pending session for `location_id`, if there is one.
    pub fn pending_session(&self, location_id: &str) -> Option<SessionWaiter> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let pending = tables.pending.get_mut(location_id)?;
        let (tx, rx) = oneshot::channel();
        pending.waiters.push(tx);
        Some(rx)
    }

    /// Atomically find an active session, join a pending one, or claim the
    /// right to dial with `outgoing`.
    pub fn provide(&self, location_id: &str, outgoing: ConnectionId) -> Provided {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = tables.active.get(location_id) {
            return Provided::Active(Arc::clone(session));
        }
        let (tx, rx) = oneshot::channel();
        if let Some(pending) = tables.pending.get_mut(location_id) {
            pending.waiters.push(tx);
            return Provided::Pending(rx);
        }
        tables.pending.insert(
            location_id.to_string(),
            PendingSession {
                outgoing,
                waiters: vec![tx],
            },
        );
        Provided::Dial(rx)
    }

    /// Register an established session and wake anyone waiting for it.
    pub fn resolve_session(
        &self,
        location_id: &str,
        connection: ConnectionId,
        session: Arc<Session>,
    ) -> WireResult<()> {
        let pending = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            if tables.active.contains_key(location_id) {
                return Err(WireError::SessionExists(location_id.to_string()));
            }
            tables
                .active
                .insert(location_id.to_string(), Arc::clone(&session));
            tables.by_connection.insert(connection, Arc::clone(&session));
            tables
                .peer_keys
                .insert(session.info().id_hex(), session.peer().public_key.clone());
            tables.pending.remove(location_id)
        };
        debug!(location = location_id, session = %session.info().id_hex(), "OCapN: session registered");
        if let Some(pending) = pending {
            pending.settle(Ok(session));
        }
        Ok(())
    }

    /// Forget a session and its peer key. Pending waiters for its location
    /// are rejected.
    pub fn end_session(&self, session: &Session) {
        let location_id = session.peer().location.id();
        let pending = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let is_current = tables
                .active
                .get(&location_id)
                .is_some_and(|s| s.id() == session.id());
            if is_current {
                tables.active.remove(&location_id);
            }
            tables
                .by_connection
                .retain(|_, s| s.id() != session.id());
            tables.peer_keys.remove(&session.info().id_hex());
            tables.pending.remove(&location_id)
        };
        if let Some(pending) = pending {
            pending.settle(Err("Session ended.".to_string()));
        }
    }

    /// Drop the connection-to-session mapping for a closed connection.
    pub fn delete_connection(&self, connection: ConnectionId) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.by_connection.remove(&connection);
    }

    /// Reject the pending session being dialled on `connection`, if any.
    pub fn reject_pending_session_for_connection(
        &self,
        connection: ConnectionId,
        reason: &str,
    ) -> bool {
        let pending = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let location_id = tables
                .pending
                .iter()
                .find(|(_, p)| p.outgoing == connection)
                .map(|(id, _)| id.clone());
            location_id.and_then(|id| tables.pending.remove(&id))
        };
        match pending {
            Some(pending) => {
                pending.settle(Err(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// Peer key of a live session, by session ID.
    pub fn peer_public_key_for_session_id(&self, session_id: &[u8]) -> Option<PublicKey> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.peer_keys.get(&hex::encode(session_id)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_pending_session_is_exclusive() {
        let sessions = SessionManager::new();
        let conn = Uuid::new_v4();
        sessions.make_pending_session("tcp:a", conn).unwrap();
        assert_eq!(sessions.outgoing_connection("tcp:a"), Some(conn));
        assert!(matches!(
            sessions.make_pending_session("tcp:a", Uuid::new_v4()),
            Err(WireError::SessionExists(_))
        ));
        assert!(sessions.outgoing_connection("tcp:b").is_none());
    }

    #[test]
    fn test_provide_claims_then_joins() {
        let sessions = SessionManager::new();
        let first = Uuid::new_v4();
        assert!(matches!(sessions.provide("tcp:a", first), Provided::Dial(_)));
        assert!(matches!(
            sessions.provide("tcp:a", Uuid::new_v4()),
            Provided::Pending(_)
        ));
        assert_eq!(sessions.outgoing_connection("tcp:a"), Some(first));
    }

    #[tokio::test]
    async fn test_reject_pending_wakes_all_waiters() {
        let sessions = SessionManager::new();
        let conn = Uuid::new_v4();
        let Provided::Dial(first) = sessions.provide("tcp:a", conn) else {
            panic!("Expected Dial");
        };
        let second = sessions.pending_session("tcp:a").unwrap();

        assert!(sessions.reject_pending_session_for_connection(conn, "Connection closed during handshake."));
        assert!(!sessions.reject_pending_session_for_connection(conn, "again"));

        for waiter in [first, second] {
            match waiter.await {
                Ok(Err(reason)) => assert_eq!(reason, "Connection closed during handshake."),
                Ok(Ok(_)) => panic!("Expected rejection, got a session"),
                Err(e) => panic!("Expected rejection, got {e:?}"),
            }
        }
        assert!(sessions.outgoing_connection("tcp:a").is_none());
        assert!(sessions.pending_session("tcp:a").is_none());
    }

    #[test]
    fn test_unknown_session_id_has_no_key() {
        let sessions = SessionManager::new();
        assert!(sessions.peer_public_key_for_session_id(&[0u8; 32]).is_none());
        assert_eq!(sessions.active_count(), 0);
    }
}
