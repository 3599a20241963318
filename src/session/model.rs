//! # Session and Connection Records
//!
//! The two durable record types of the lifecycle layer. A Session is the
//! broadcast scope (one speaker, many listeners); a Connection is one live
//! transport channel bound to a session and a role.

use crate::session::slug;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
        }
    }
}

/// A named broadcast scope. `session_id` and `speaker_principal` are set at
/// creation and never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub speaker_principal: String,
    pub source_language: String,
    pub status: SessionStatus,
    pub muted: bool,
    pub created_at: DateTime<Utc>,
    pub max_duration_deadline: DateTime<Utc>,
}

impl Session {
    pub fn new(speaker_principal: String, source_language: String, max_duration: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: slug::generate(),
            speaker_principal,
            source_language,
            status: SessionStatus::Active,
            muted: false,
            created_at: now,
            max_duration_deadline: now + max_duration,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Role of a connection within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Speaker,
    Listener,
}

impl ConnectionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::Speaker => "speaker",
            ConnectionRole::Listener => "listener",
        }
    }
}

/// One live transport-level channel.
///
/// `generation` increases by one each time a logical client identity replaces
/// its connection through a refresh; it is what lets the server discard a
/// stale connection after a refresh races.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub connection_id: String,
    pub session_id: String,
    pub role: ConnectionRole,
    /// Required iff `role == Listener`
    pub target_language: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// connected_at + the transport's connection ceiling
    pub expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub generation: u64,
    /// Set by the RefreshCoordinator once a successor has taken over
    pub superseded: bool,
}

impl Connection {
    /// `connection_id` is the opaque handle the transport layer assigned at
    /// connect time.
    pub fn new(
        connection_id: String,
        session_id: String,
        role: ConnectionRole,
        target_language: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            session_id,
            role,
            target_language,
            connected_at: now,
            expires_at: now + ttl,
            last_seen_at: now,
            generation: 1,
            superseded: false,
        }
    }

    /// Fresh transport handle for a new connection.
    pub fn assign_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Successor record for a refresh: same logical identity, next generation.
    pub fn successor_of(previous: &Connection, connection_id: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            session_id: previous.session_id.clone(),
            role: previous.role,
            target_language: previous.target_language.clone(),
            connected_at: now,
            expires_at: now + ttl,
            last_seen_at: now,
            generation: previous.generation + 1,
            superseded: false,
        }
    }

    /// Live means "still a valid delivery target": not yet superseded.
    pub fn is_live(&self) -> bool {
        !self.superseded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successor_bumps_generation_and_keeps_identity() {
        let first = Connection::new(
            Connection::assign_id(),
            "golden-eagle-427".to_string(),
            ConnectionRole::Listener,
            Some("es".to_string()),
            Duration::hours(2),
        );
        let second =
            Connection::successor_of(&first, Connection::assign_id(), Duration::hours(2));

        assert_ne!(first.connection_id, second.connection_id);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.role, ConnectionRole::Listener);
        assert_eq!(second.target_language.as_deref(), Some("es"));
        assert_eq!(second.generation, 2);
        assert!(second.is_live());
    }

    #[test]
    fn session_starts_active_and_unmuted() {
        let session = Session::new(
            "speaker-1".to_string(),
            "en".to_string(),
            Duration::hours(8),
        );
        assert!(session.is_active());
        assert!(!session.muted);
        assert!(session.max_duration_deadline > session.created_at);
    }
}
