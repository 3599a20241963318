//! # Connection Registry
//!
//! Role-correct admission in front of the SessionStore. Every connection that
//! the transport layer accepts must have a registry record before admission
//! reports success — the record is persisted synchronously, so the disconnect
//! path can always account for the connection it is releasing.
//!
//! ## Role Assignment:
//! The requested role is advisory; the registry forces the outcome. A
//! principal matching the session's `speaker_principal` becomes the speaker
//! (rejected if a live speaker connection exists); everyone else, anonymous
//! or not, becomes a listener and must name a target language.

use crate::auth::Principal;
use crate::error::AdmissionError;
use crate::session::model::{Connection, ConnectionRole, Session, SessionStatus};
use crate::session::store::{SessionStore, StoreError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// One admission request, produced by the WebSocket layer after the
/// Authorizer has classified the attempt.
#[derive(Debug, Clone)]
pub struct AdmitRequest {
    /// Opaque handle the transport layer assigned at connect time
    pub connection_id: String,
    pub session_id: String,
    pub principal: Principal,
    pub target_language: Option<String>,
}

/// Sole writer of Connection records.
pub struct ConnectionRegistry {
    store: Arc<dyn SessionStore>,
    /// The transport's connection ceiling; stamped into `expires_at`
    connection_ttl: Duration,
    max_concurrent_sessions: usize,
    max_listeners_per_session: usize,
}

impl ConnectionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connection_ttl: Duration,
        max_concurrent_sessions: usize,
        max_listeners_per_session: usize,
    ) -> Self {
        Self {
            store,
            connection_ttl,
            max_concurrent_sessions,
            max_listeners_per_session,
        }
    }

    /// Create a new broadcast session owned by `speaker_principal`.
    pub async fn create_session(
        &self,
        speaker_principal: String,
        source_language: String,
        max_duration: Duration,
    ) -> Result<Session, AdmissionError> {
        let active = self
            .store
            .count_active_sessions()
            .await
            .map_err(store_error)?;
        if active >= self.max_concurrent_sessions {
            return Err(AdmissionError::CapacityExceeded(self.max_concurrent_sessions));
        }

        // Slug collisions are settled by the conditional write: retry with a
        // fresh slug instead of failing the caller
        for _ in 0..3 {
            let session = Session::new(
                speaker_principal.clone(),
                source_language.clone(),
                max_duration,
            );
            match self.store.create_session(session.clone()).await {
                Ok(()) => {
                    info!(session_id = %session.session_id, "Session created");
                    return Ok(session);
                }
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(store_error(err)),
            }
        }
        Err(AdmissionError::Store(
            "could not allocate a unique session id".to_string(),
        ))
    }

    /// Admit one connection attempt. The Connection record exists in the
    /// store before this returns Ok.
    pub async fn admit(&self, request: AdmitRequest) -> Result<Connection, AdmissionError> {
        let session = self.load_active_session(&request.session_id).await?;

        if principal_is_speaker(&request.principal, &session) {
            let connection = Connection::new(
                request.connection_id.clone(),
                session.session_id.clone(),
                ConnectionRole::Speaker,
                None,
                self.connection_ttl,
            );
            match self.store.create_speaker_connection(connection.clone()).await {
                Ok(()) => {
                    info!(
                        session_id = %session.session_id,
                        connection_id = %connection.connection_id,
                        "Speaker admitted"
                    );
                    Ok(connection)
                }
                Err(StoreError::Conflict(_)) => {
                    Err(AdmissionError::DuplicateSpeaker(session.session_id))
                }
                Err(err) => Err(store_error(err)),
            }
        } else {
            let target_language = request
                .target_language
                .filter(|l| !l.is_empty())
                .ok_or(AdmissionError::MissingLanguage)?;

            let listeners = self
                .store
                .connections_for_session(&session.session_id)
                .await
                .map_err(store_error)?
                .iter()
                .filter(|c| c.role == ConnectionRole::Listener)
                .count();
            if listeners >= self.max_listeners_per_session {
                return Err(AdmissionError::CapacityExceeded(
                    self.max_listeners_per_session,
                ));
            }

            let connection = Connection::new(
                request.connection_id.clone(),
                session.session_id.clone(),
                ConnectionRole::Listener,
                Some(target_language),
                self.connection_ttl,
            );
            self.store
                .create_connection(connection.clone())
                .await
                .map_err(store_error)?;
            info!(
                session_id = %session.session_id,
                connection_id = %connection.connection_id,
                target_language = ?connection.target_language,
                "Listener admitted"
            );
            Ok(connection)
        }
    }

    /// Admission for the successor connection of a refresh window. The
    /// single-speaker conditional is deliberately not applied: old and new
    /// are both valid until the switch, disambiguated by `generation`.
    pub async fn admit_refresh(
        &self,
        previous_connection_id: &str,
        request: AdmitRequest,
    ) -> Result<Connection, AdmissionError> {
        let session = self.load_active_session(&request.session_id).await?;

        let previous = self
            .store
            .get_connection(previous_connection_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| {
                AdmissionError::UnknownPredecessor(previous_connection_id.to_string())
            })?;

        if previous.session_id != session.session_id {
            return Err(AdmissionError::UnknownPredecessor(
                previous_connection_id.to_string(),
            ));
        }

        // The successor must present the same identity class as its
        // predecessor: a speaker slot cannot be refreshed into by anyone else
        let attempted_role = if principal_is_speaker(&request.principal, &session) {
            ConnectionRole::Speaker
        } else {
            ConnectionRole::Listener
        };
        if attempted_role != previous.role {
            return Err(AdmissionError::UnknownPredecessor(
                previous_connection_id.to_string(),
            ));
        }

        let mut connection = Connection::successor_of(
            &previous,
            request.connection_id.clone(),
            self.connection_ttl,
        );
        if let Some(language) = request.target_language.filter(|l| !l.is_empty()) {
            if connection.role == ConnectionRole::Listener {
                connection.target_language = Some(language);
            }
        }

        self.store
            .create_connection(connection.clone())
            .await
            .map_err(store_error)?;
        info!(
            session_id = %session.session_id,
            old_connection_id = %previous_connection_id,
            new_connection_id = %connection.connection_id,
            generation = connection.generation,
            "Refresh successor admitted"
        );
        Ok(connection)
    }

    /// Heartbeat touch. A connection that was concurrently released is a
    /// no-op, never an error.
    pub async fn touch(&self, connection_id: &str) {
        trace!(connection_id = %connection_id, "Heartbeat touch");
        let _ = self.store.touch_connection(connection_id, Utc::now()).await;
    }

    /// Delete the connection record. Idempotent.
    pub async fn release(&self, connection_id: &str) {
        debug!(connection_id = %connection_id, "Releasing connection record");
        let _ = self.store.delete_connection(connection_id).await;
    }

    /// Flag a connection as superseded by its refresh successor.
    pub async fn mark_superseded(&self, connection_id: &str) {
        let _ = self.store.mark_superseded(connection_id).await;
    }

    pub async fn find_connection(&self, connection_id: &str) -> Option<Connection> {
        self.store.get_connection(connection_id).await.ok().flatten()
    }

    pub async fn find_speaker_connection(&self, session_id: &str) -> Option<Connection> {
        self.store
            .connections_for_session(session_id)
            .await
            .ok()?
            .into_iter()
            .find(|c| c.role == ConnectionRole::Speaker && c.is_live())
    }

    pub async fn find_listeners(
        &self,
        session_id: &str,
        target_language: Option<&str>,
    ) -> Vec<Connection> {
        self.store
            .connections_for_session(session_id)
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.role == ConnectionRole::Listener)
            .filter(|c| match target_language {
                Some(lang) => c.target_language.as_deref() == Some(lang),
                None => true,
            })
            .collect()
    }

    /// Rewrite a listener's target language. The playback flush-and-reset
    /// that goes with it is the client's side of the contract.
    pub async fn change_language(
        &self,
        connection_id: &str,
        target_language: &str,
    ) -> Result<(), AdmissionError> {
        if target_language.is_empty() {
            return Err(AdmissionError::MissingLanguage);
        }
        self.store
            .set_connection_language(connection_id, target_language)
            .await
            .map_err(store_error)
    }

    async fn load_active_session(&self, session_id: &str) -> Result<Session, AdmissionError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| AdmissionError::SessionNotFound(session_id.to_string()))?;
        if session.status != SessionStatus::Active {
            return Err(AdmissionError::SessionNotFound(session_id.to_string()));
        }
        Ok(session)
    }
}

fn principal_is_speaker(principal: &Principal, session: &Session) -> bool {
    principal.subject() == Some(session.speaker_principal.as_str())
}

fn store_error(err: StoreError) -> AdmissionError {
    AdmissionError::Store(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemorySessionStore;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(
            Arc::new(MemorySessionStore::new()),
            Duration::hours(2),
            50,
            500,
        )
    }

    fn speaker() -> Principal {
        Principal::Speaker {
            subject: "speaker-1".to_string(),
            email: None,
        }
    }

    async fn seeded(registry: &ConnectionRegistry) -> Session {
        registry
            .create_session("speaker-1".to_string(), "en".to_string(), Duration::hours(8))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn speaker_and_anonymous_listener_are_admitted_with_correct_roles() {
        let registry = registry();
        let session = seeded(&registry).await;

        let speaker_conn = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: speaker(),
                target_language: None,
            })
            .await
            .unwrap();
        assert_eq!(speaker_conn.role, ConnectionRole::Speaker);
        assert_eq!(speaker_conn.generation, 1);

        let listener_conn = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: Principal::Anonymous,
                target_language: Some("es".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(listener_conn.role, ConnectionRole::Listener);
        assert_eq!(listener_conn.target_language.as_deref(), Some("es"));
    }

    #[tokio::test]
    async fn authenticated_non_owner_is_admitted_as_listener() {
        let registry = registry();
        let session = seeded(&registry).await;

        let other = Principal::Speaker {
            subject: "someone-else".to_string(),
            email: None,
        };
        let conn = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: other,
                target_language: Some("fr".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(conn.role, ConnectionRole::Listener);
    }

    #[tokio::test]
    async fn listener_without_language_is_rejected() {
        let registry = registry();
        let session = seeded(&registry).await;

        let err = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: Principal::Anonymous,
                target_language: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::MissingLanguage);
    }

    #[tokio::test]
    async fn concurrent_speaker_admissions_resolve_to_one_winner() {
        let registry = Arc::new(registry());
        let session = seeded(&registry).await;

        let a = registry.admit(AdmitRequest {
            connection_id: Connection::assign_id(),
            session_id: session.session_id.clone(),
            principal: speaker(),
            target_language: None,
        });
        let b = registry.admit(AdmitRequest {
            connection_id: Connection::assign_id(),
            session_id: session.session_id.clone(),
            principal: speaker(),
            target_language: None,
        });

        let (a, b) = tokio::join!(a, b);
        let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);

        let failure = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
        assert!(matches!(failure, AdmissionError::DuplicateSpeaker(_)));
    }

    #[tokio::test]
    async fn listener_capacity_is_enforced_per_session() {
        let registry = ConnectionRegistry::new(
            Arc::new(MemorySessionStore::new()),
            Duration::hours(2),
            50,
            2,
        );
        let session = seeded(&registry).await;

        for _ in 0..2 {
            registry
                .admit(AdmitRequest {
                    connection_id: Connection::assign_id(),
                    session_id: session.session_id.clone(),
                    principal: Principal::Anonymous,
                    target_language: Some("es".to_string()),
                })
                .await
                .unwrap();
        }

        let err = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: Principal::Anonymous,
                target_language: Some("es".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::CapacityExceeded(2));
    }

    #[tokio::test]
    async fn admission_to_missing_or_ended_session_is_refused() {
        let registry = registry();

        let err = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: "no-such-session".to_string(),
                principal: Principal::Anonymous,
                target_language: Some("es".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn touch_after_release_is_a_no_op() {
        let registry = registry();
        let session = seeded(&registry).await;

        let conn = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: Principal::Anonymous,
                target_language: Some("es".to_string()),
            })
            .await
            .unwrap();

        registry.release(&conn.connection_id).await;
        // Racing heartbeat: must not error or resurrect the record
        registry.touch(&conn.connection_id).await;
        assert!(registry.find_connection(&conn.connection_id).await.is_none());
        registry.release(&conn.connection_id).await;
    }

    #[tokio::test]
    async fn refresh_admission_bumps_generation_and_allows_parallel_speaker() {
        let registry = registry();
        let session = seeded(&registry).await;

        let first = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: speaker(),
                target_language: None,
            })
            .await
            .unwrap();

        // During the window both connections exist; the conditional would
        // have refused this, admit_refresh must not
        let second = registry
            .admit_refresh(
                &first.connection_id,
                AdmitRequest {
                    connection_id: Connection::assign_id(),
                    session_id: session.session_id.clone(),
                    principal: speaker(),
                    target_language: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(second.generation, 2);
        assert_eq!(second.role, ConnectionRole::Speaker);
        assert!(registry.find_connection(&first.connection_id).await.is_some());
    }

    #[tokio::test]
    async fn refresh_admission_rejects_identity_mismatch() {
        let registry = registry();
        let session = seeded(&registry).await;

        let speaker_conn = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id.clone(),
                principal: speaker(),
                target_language: None,
            })
            .await
            .unwrap();

        // An anonymous client cannot refresh into the speaker slot
        let err = registry
            .admit_refresh(
                &speaker_conn.connection_id,
                AdmitRequest {
                    connection_id: Connection::assign_id(),
                    session_id: session.session_id.clone(),
                    principal: Principal::Anonymous,
                    target_language: Some("es".to_string()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::UnknownPredecessor(_)));
    }
}
