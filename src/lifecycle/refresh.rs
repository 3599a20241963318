//! # Refresh Coordinator
//!
//! Make-before-break replacement of a connection before it hits the
//! transport's lifetime ceiling, without losing or duplicating in-flight
//! audio.
//!
//! ## Protocol:
//! 1. `begin` opens a RefreshWindow and asks the peer (control message) to
//!    open a second logical connection with the same session/role/credentials
//! 2. the successor runs the normal admission path; old and new are both
//!    valid for the window, distinguished by `generation`
//! 3. `successor_connected` marks the window switched, flags the predecessor
//!    superseded, and tells the old connection's worker to deliver the switch
//!    instruction
//! 4. the old connection retires only after the switch is acknowledged (or a
//!    bounded grace period, enforced by its worker)
//! 5. no successor in time → retry the whole window with exponential backoff
//!    (base 30s, cap 5min) while the old connection stays fully active; a
//!    refresh failure never causes a disconnect by itself
//!
//! The retry loop is cancelled when the old connection closes for unrelated
//! reasons (`abandon`).

use crate::config::LifecycleConfig;
use crate::error::RefreshError;
use crate::session::model::Connection;
use crate::session::registry::ConnectionRegistry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Control signals delivered to the old connection's worker.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshSignal {
    /// Ask the peer to open its parallel connection
    RefreshRequired {
        refresh_at: DateTime<Utc>,
        warning_at: DateTime<Utc>,
        attempt: u32,
    },

    /// Successor confirmed: instruct the switch and begin retirement
    Switched { new_connection_id: String },
}

pub type RefreshHandle = UnboundedSender<RefreshSignal>;

/// Window lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshWindowState {
    Pending,
    Switched,
    Closed,
}

/// Ephemeral record of one in-flight refresh. Not persisted.
#[derive(Debug, Clone)]
pub struct RefreshWindow {
    pub old_connection_id: String,
    pub new_connection_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub state: RefreshWindowState,
    /// Number of refresh requests sent so far (1 = the initial one)
    pub attempts: u32,
}

struct WindowEntry {
    window: RefreshWindow,
    peer: RefreshHandle,
    refresh_at: DateTime<Utc>,
    warning_at: DateTime<Utc>,
}

/// Orchestrates all in-flight refresh windows, keyed by the old connection.
pub struct RefreshCoordinator {
    windows: Mutex<HashMap<String, WindowEntry>>,
    registry: Arc<ConnectionRegistry>,
    lifecycle: LifecycleConfig,
}

impl RefreshCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, lifecycle: LifecycleConfig) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            registry,
            lifecycle,
        }
    }

    /// Open a refresh window for `connection` and send the first refresh
    /// request to its peer. Idempotent: a window already open for this
    /// connection is returned unchanged.
    pub fn begin(self: &Arc<Self>, connection: &Connection, peer: RefreshHandle) -> RefreshWindow {
        let refresh_at = connection.expires_at
            - ChronoDuration::seconds(self.lifecycle.refresh_margin_secs as i64);
        let warning_at =
            refresh_at - ChronoDuration::seconds(self.lifecycle.refresh_warning_secs as i64);

        let window = {
            let mut windows = self.windows.lock().unwrap();
            if let Some(existing) = windows.get(&connection.connection_id) {
                return existing.window.clone();
            }

            let window = RefreshWindow {
                old_connection_id: connection.connection_id.clone(),
                new_connection_id: None,
                started_at: Utc::now(),
                state: RefreshWindowState::Pending,
                attempts: 1,
            };
            let _ = peer.send(RefreshSignal::RefreshRequired {
                refresh_at,
                warning_at,
                attempt: 1,
            });
            windows.insert(
                connection.connection_id.clone(),
                WindowEntry {
                    window: window.clone(),
                    peer,
                    refresh_at,
                    warning_at,
                },
            );
            window
        };

        info!(
            connection_id = %connection.connection_id,
            refresh_at = %refresh_at,
            "Refresh window opened"
        );
        self.clone().spawn_retry(connection.connection_id.clone());
        window
    }

    /// The successor connection reached CONNECTED: flag the predecessor
    /// superseded and signal the switch through the old connection's worker.
    pub async fn successor_connected(
        &self,
        old_connection_id: &str,
        new_connection_id: &str,
    ) -> Result<RefreshWindow, RefreshError> {
        let (window, peer) = {
            let mut windows = self.windows.lock().unwrap();
            let entry = windows
                .get_mut(old_connection_id)
                .ok_or_else(|| RefreshError::WindowNotFound(old_connection_id.to_string()))?;

            // A re-delivered confirmation is not an error
            if entry.window.state == RefreshWindowState::Switched {
                return Ok(entry.window.clone());
            }

            entry.window.state = RefreshWindowState::Switched;
            entry.window.new_connection_id = Some(new_connection_id.to_string());
            (entry.window.clone(), entry.peer.clone())
        };

        self.registry.mark_superseded(old_connection_id).await;
        let _ = peer.send(RefreshSignal::Switched {
            new_connection_id: new_connection_id.to_string(),
        });

        info!(
            old_connection_id = %old_connection_id,
            new_connection_id = %new_connection_id,
            "Refresh switch signaled"
        );
        Ok(window)
    }

    /// Drop the window for a connection that closed. Cancels the retry loop.
    /// Safe to call for connections with no open window.
    pub fn abandon(&self, old_connection_id: &str) {
        let mut windows = self.windows.lock().unwrap();
        if let Some(entry) = windows.remove(old_connection_id) {
            if entry.window.state == RefreshWindowState::Pending {
                debug!(
                    connection_id = %old_connection_id,
                    attempts = entry.window.attempts,
                    "Refresh abandoned, connection closed"
                );
            }
        }
    }

    /// Observe a window (tests, metrics).
    pub fn window(&self, old_connection_id: &str) -> Option<RefreshWindow> {
        self.windows
            .lock()
            .unwrap()
            .get(old_connection_id)
            .map(|e| e.window.clone())
    }

    /// Bounded retry loop: wait for the successor, and while the window is
    /// still pending re-request with exponential backoff. Exits as soon as
    /// the window switches or is abandoned.
    fn spawn_retry(self: Arc<Self>, old_connection_id: String) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.lifecycle.refresh_timeout()).await;

                let attempts = {
                    let mut windows = self.windows.lock().unwrap();
                    match windows.get_mut(&old_connection_id) {
                        Some(entry) if entry.window.state == RefreshWindowState::Pending => {
                            entry.window.attempts += 1;
                            entry.window.attempts
                        }
                        _ => break,
                    }
                };

                let err = RefreshError::SuccessorTimeout {
                    attempts: attempts - 1,
                };
                warn!(
                    connection_id = %old_connection_id,
                    error = %err,
                    "Refresh retry; old connection stays active"
                );

                tokio::time::sleep(self.lifecycle.refresh_backoff(attempts - 1)).await;

                let send_failed = {
                    let windows = self.windows.lock().unwrap();
                    match windows.get(&old_connection_id) {
                        Some(entry) if entry.window.state == RefreshWindowState::Pending => entry
                            .peer
                            .send(RefreshSignal::RefreshRequired {
                                refresh_at: entry.refresh_at,
                                warning_at: entry.warning_at,
                                attempt: attempts,
                            })
                            .is_err(),
                        _ => break,
                    }
                };

                if send_failed {
                    // Peer worker is gone; nothing left to refresh
                    self.windows.lock().unwrap().remove(&old_connection_id);
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use crate::session::registry::AdmitRequest;
    use crate::session::store::MemorySessionStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<RefreshCoordinator>, Arc<ConnectionRegistry>, Connection) {
        let store = Arc::new(MemorySessionStore::new());
        let registry = Arc::new(ConnectionRegistry::new(
            store,
            ChronoDuration::hours(2),
            50,
            500,
        ));
        let session = registry
            .create_session("speaker-1".to_string(), "en".to_string(), ChronoDuration::hours(8))
            .await
            .unwrap();
        let connection = registry
            .admit(AdmitRequest {
                connection_id: Connection::assign_id(),
                session_id: session.session_id,
                principal: Principal::Speaker {
                    subject: "speaker-1".to_string(),
                    email: None,
                },
                target_language: None,
            })
            .await
            .unwrap();
        let coordinator = Arc::new(RefreshCoordinator::new(
            registry.clone(),
            crate::config::AppConfig::default().lifecycle,
        ));
        (coordinator, registry, connection)
    }

    #[tokio::test]
    async fn begin_requests_refresh_and_switch_retires_predecessor() {
        let (coordinator, registry, connection) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let window = coordinator.begin(&connection, tx);
        assert_eq!(window.state, RefreshWindowState::Pending);
        assert_eq!(window.attempts, 1);

        match rx.recv().await.unwrap() {
            RefreshSignal::RefreshRequired { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("unexpected signal: {:?}", other),
        }

        let window = coordinator
            .successor_connected(&connection.connection_id, "successor-1")
            .await
            .unwrap();
        assert_eq!(window.state, RefreshWindowState::Switched);
        assert_eq!(window.new_connection_id.as_deref(), Some("successor-1"));

        match rx.recv().await.unwrap() {
            RefreshSignal::Switched { new_connection_id } => {
                assert_eq!(new_connection_id, "successor-1")
            }
            other => panic!("unexpected signal: {:?}", other),
        }

        // Predecessor flagged, but its record still exists until it retires
        let old = registry
            .find_connection(&connection.connection_id)
            .await
            .unwrap();
        assert!(old.superseded);
    }

    #[tokio::test]
    async fn duplicate_switch_confirmation_is_idempotent() {
        let (coordinator, _registry, connection) = setup().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        coordinator.begin(&connection, tx);

        coordinator
            .successor_connected(&connection.connection_id, "successor-1")
            .await
            .unwrap();
        let window = coordinator
            .successor_connected(&connection.connection_id, "successor-1")
            .await
            .unwrap();
        assert_eq!(window.new_connection_id.as_deref(), Some("successor-1"));
    }

    #[tokio::test]
    async fn successor_for_unknown_window_is_refused() {
        let (coordinator, _registry, _connection) = setup().await;
        let err = coordinator
            .successor_connected("nobody", "successor-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::WindowNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_window_retries_with_backoff() {
        let (coordinator, _registry, connection) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.begin(&connection, tx);

        match rx.recv().await.unwrap() {
            RefreshSignal::RefreshRequired { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("unexpected signal: {:?}", other),
        }

        // No successor arrives; paused time fast-forwards through the
        // timeout and the 30s backoff to the second request
        match rx.recv().await.unwrap() {
            RefreshSignal::RefreshRequired { attempt, .. } => assert_eq!(attempt, 2),
            other => panic!("unexpected signal: {:?}", other),
        }

        let window = coordinator.window(&connection.connection_id).unwrap();
        assert_eq!(window.state, RefreshWindowState::Pending);
        assert!(window.attempts >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_cancels_the_retry_loop() {
        let (coordinator, _registry, connection) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.begin(&connection, tx);
        assert!(rx.recv().await.is_some());

        coordinator.abandon(&connection.connection_id);
        assert!(coordinator.window(&connection.connection_id).is_none());

        // Retry task wakes, finds no window, exits; all senders drop
        let next = tokio::time::timeout(Duration::from_secs(7200), rx.recv()).await;
        assert!(matches!(next, Ok(None)));
    }
}
