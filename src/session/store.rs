//! # Session Store
//!
//! The read/write contract for Session and Connection records. The trait is
//! the seam a durable backend would implement; what matters to the lifecycle
//! layer is the two atomic conditional writes:
//!
//! - `create_session` / `create_connection`: create iff not exists
//! - `create_speaker_connection`: create iff the session has no live speaker
//!   connection — the single-speaker invariant is enforced here, inside one
//!   store operation, so concurrent admissions cannot both succeed
//!
//! `MemorySessionStore` keeps everything in locked maps and is the default
//! backing for a single-node deployment and for tests.

use crate::session::model::{Connection, ConnectionRole, Session, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Failures from the storage layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A conditional write found the condition violated
    Conflict(String),

    /// Backend failure (I/O, serialization, ...)
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict(msg) => write!(f, "Conditional write failed: {}", msg),
            StoreError::Backend(msg) => write!(f, "Store backend error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Keyed storage for Session and Connection records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session iff no session with that ID exists.
    async fn create_session(&self, session: Session) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError>;

    async fn set_session_muted(&self, session_id: &str, muted: bool) -> Result<(), StoreError>;

    async fn count_active_sessions(&self) -> Result<usize, StoreError>;

    /// Create a connection iff no connection with that ID exists.
    async fn create_connection(&self, connection: Connection) -> Result<(), StoreError>;

    /// Create a speaker connection iff the session has no live (non-superseded)
    /// speaker connection. The single-speaker conditional.
    async fn create_speaker_connection(&self, connection: Connection) -> Result<(), StoreError>;

    async fn get_connection(&self, connection_id: &str)
        -> Result<Option<Connection>, StoreError>;

    /// Update `last_seen_at`. A connection that no longer exists is a no-op —
    /// heartbeats racing a disconnect are expected.
    async fn touch_connection(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete a connection record. Idempotent.
    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError>;

    /// Flag a connection as superseded by its refresh successor.
    async fn mark_superseded(&self, connection_id: &str) -> Result<(), StoreError>;

    async fn set_connection_language(
        &self,
        connection_id: &str,
        target_language: &str,
    ) -> Result<(), StoreError>;

    async fn connections_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Connection>, StoreError>;
}

/// In-memory SessionStore behind reader-writer locks.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    connections: RwLock<HashMap<String, Connection>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, session: Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!(
                "session '{}' already exists",
                session.session_id
            )));
        }
        sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().unwrap().get(session_id).cloned())
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.status = status;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "session '{}' does not exist",
                session_id
            ))),
        }
    }

    async fn set_session_muted(&self, session_id: &str, muted: bool) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.muted = muted;
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "session '{}' does not exist",
                session_id
            ))),
        }
    }

    async fn count_active_sessions(&self) -> Result<usize, StoreError> {
        Ok(self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .count())
    }

    async fn create_connection(&self, connection: Connection) -> Result<(), StoreError> {
        let mut connections = self.connections.write().unwrap();
        if connections.contains_key(&connection.connection_id) {
            return Err(StoreError::Conflict(format!(
                "connection '{}' already exists",
                connection.connection_id
            )));
        }
        connections.insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn create_speaker_connection(&self, connection: Connection) -> Result<(), StoreError> {
        // Check and insert under one write lock: two concurrent speaker
        // admissions must resolve to exactly one success
        let mut connections = self.connections.write().unwrap();
        let existing = connections.values().any(|c| {
            c.session_id == connection.session_id
                && c.role == ConnectionRole::Speaker
                && c.is_live()
        });
        if existing {
            return Err(StoreError::Conflict(format!(
                "session '{}' already has a live speaker connection",
                connection.session_id
            )));
        }
        connections.insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    async fn get_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<Connection>, StoreError> {
        Ok(self.connections.read().unwrap().get(connection_id).cloned())
    }

    async fn touch_connection(
        &self,
        connection_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut connections = self.connections.write().unwrap();
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.last_seen_at = at;
        }
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), StoreError> {
        self.connections.write().unwrap().remove(connection_id);
        Ok(())
    }

    async fn mark_superseded(&self, connection_id: &str) -> Result<(), StoreError> {
        let mut connections = self.connections.write().unwrap();
        if let Some(connection) = connections.get_mut(connection_id) {
            connection.superseded = true;
        }
        Ok(())
    }

    async fn set_connection_language(
        &self,
        connection_id: &str,
        target_language: &str,
    ) -> Result<(), StoreError> {
        let mut connections = self.connections.write().unwrap();
        match connections.get_mut(connection_id) {
            Some(connection) => {
                connection.target_language = Some(target_language.to_string());
                Ok(())
            }
            None => Err(StoreError::Conflict(format!(
                "connection '{}' does not exist",
                connection_id
            ))),
        }
    }

    async fn connections_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Connection>, StoreError> {
        Ok(self
            .connections
            .read()
            .unwrap()
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> Session {
        Session::new("speaker-1".to_string(), "en".to_string(), Duration::hours(8))
    }

    fn speaker_conn(session_id: &str) -> Connection {
        Connection::new(
            Connection::assign_id(),
            session_id.to_string(),
            ConnectionRole::Speaker,
            None,
            Duration::hours(2),
        )
    }

    #[tokio::test]
    async fn create_session_is_conditional_on_absence() {
        let store = MemorySessionStore::new();
        let s = session();
        store.create_session(s.clone()).await.unwrap();
        assert!(matches!(
            store.create_session(s).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn speaker_conditional_rejects_second_live_speaker() {
        let store = MemorySessionStore::new();
        let s = session();
        let id = s.session_id.clone();
        store.create_session(s).await.unwrap();

        store.create_speaker_connection(speaker_conn(&id)).await.unwrap();
        assert!(matches!(
            store.create_speaker_connection(speaker_conn(&id)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn superseded_speaker_no_longer_blocks_admission() {
        let store = MemorySessionStore::new();
        let s = session();
        let id = s.session_id.clone();
        store.create_session(s).await.unwrap();

        let first = speaker_conn(&id);
        let first_id = first.connection_id.clone();
        store.create_speaker_connection(first).await.unwrap();
        store.mark_superseded(&first_id).await.unwrap();

        store.create_speaker_connection(speaker_conn(&id)).await.unwrap();
    }

    #[tokio::test]
    async fn touch_and_delete_are_safe_when_absent() {
        let store = MemorySessionStore::new();
        store.touch_connection("ghost", Utc::now()).await.unwrap();
        store.delete_connection("ghost").await.unwrap();
        store.delete_connection("ghost").await.unwrap();
    }
}
