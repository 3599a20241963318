//! # Lifecycle Coordinator
//!
//! One instance per live transport connection, owned by that connection's
//! worker — all mutation happens on the owning worker, so the struct itself
//! needs no lock.
//!
//! ## State Machine:
//! `Connecting → Connected → Refreshing → Closed`, with `Connected → Closed`
//! directly on ordinary disconnect and `Connecting → Closed` when
//! authorization or admission refuses the attempt. `Closed` is terminal.

use crate::lifecycle::events::{
    CloseReason, LifecycleEvent, LifecycleEventSender, LifecycleState,
};
use chrono::Utc;
use tracing::{info, warn};

/// Per-connection state machine driving connect/heartbeat/disconnect.
pub struct LifecycleCoordinator {
    connection_id: String,
    state: LifecycleState,
    close_reason: Option<CloseReason>,
    events: Option<LifecycleEventSender>,
}

impl LifecycleCoordinator {
    pub fn new(connection_id: String, events: Option<LifecycleEventSender>) -> Self {
        Self {
            connection_id,
            state: LifecycleState::Connecting,
            close_reason: None,
            events,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The reason recorded when the connection reached `Closed`.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Audio may flow in `Connected` and, non-blocking, throughout the
    /// refresh window.
    pub fn can_serve_audio(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::Connected | LifecycleState::Refreshing
        )
    }

    pub fn is_closed(&self) -> bool {
        self.state == LifecycleState::Closed
    }

    /// Perform one transition. Invalid edges are rejected; `Closed` is
    /// terminal. Every accepted transition is emitted as an event.
    pub fn transition(
        &mut self,
        to: LifecycleState,
        reason: Option<CloseReason>,
    ) -> Result<(), String> {
        let from = self.state;
        let allowed = matches!(
            (from, to),
            (LifecycleState::Connecting, LifecycleState::Connected)
                | (LifecycleState::Connecting, LifecycleState::Closed)
                | (LifecycleState::Connected, LifecycleState::Refreshing)
                | (LifecycleState::Connected, LifecycleState::Closed)
                | (LifecycleState::Refreshing, LifecycleState::Closed)
        );
        if !allowed {
            warn!(
                connection_id = %self.connection_id,
                from = from.as_str(),
                to = to.as_str(),
                "Rejected lifecycle transition"
            );
            return Err(format!(
                "invalid lifecycle transition {} -> {}",
                from.as_str(),
                to.as_str()
            ));
        }

        self.state = to;
        if to == LifecycleState::Closed {
            self.close_reason = reason.clone();
        }

        info!(
            connection_id = %self.connection_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = ?reason,
            "Lifecycle transition"
        );

        if let Some(events) = &self.events {
            let _ = events.send(LifecycleEvent {
                connection_id: self.connection_id.clone(),
                from,
                to,
                reason,
                at: Utc::now(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn coordinator() -> (LifecycleCoordinator, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LifecycleCoordinator::new("conn-1".to_string(), Some(tx)), rx)
    }

    #[test]
    fn full_refresh_path_is_accepted() {
        let (mut lc, mut rx) = coordinator();
        assert_eq!(lc.state(), LifecycleState::Connecting);

        lc.transition(LifecycleState::Connected, None).unwrap();
        assert!(lc.can_serve_audio());

        lc.transition(LifecycleState::Refreshing, None).unwrap();
        // Traffic keeps flowing while the successor is stood up
        assert!(lc.can_serve_audio());

        lc.transition(LifecycleState::Closed, Some(CloseReason::Superseded))
            .unwrap();
        assert!(lc.is_closed());
        assert_eq!(lc.close_reason(), Some(&CloseReason::Superseded));

        let transitions: Vec<(LifecycleState, LifecycleState)> = std::iter::from_fn(|| {
            rx.try_recv().ok().map(|e| (e.from, e.to))
        })
        .collect();
        assert_eq!(
            transitions,
            vec![
                (LifecycleState::Connecting, LifecycleState::Connected),
                (LifecycleState::Connected, LifecycleState::Refreshing),
                (LifecycleState::Refreshing, LifecycleState::Closed),
            ]
        );
    }

    #[test]
    fn ordinary_disconnect_skips_refreshing() {
        let (mut lc, _rx) = coordinator();
        lc.transition(LifecycleState::Connected, None).unwrap();
        lc.transition(LifecycleState::Closed, Some(CloseReason::Normal))
            .unwrap();
        assert!(lc.is_closed());
    }

    #[test]
    fn admission_failure_closes_from_connecting() {
        let (mut lc, _rx) = coordinator();
        lc.transition(
            LifecycleState::Closed,
            Some(CloseReason::AdmissionRefused("no such session".to_string())),
        )
        .unwrap();
        assert!(lc.is_closed());
    }

    #[test]
    fn closed_is_terminal_and_bad_edges_are_rejected() {
        let (mut lc, _rx) = coordinator();

        // Cannot refresh before being connected
        assert!(lc.transition(LifecycleState::Refreshing, None).is_err());

        lc.transition(LifecycleState::Connected, None).unwrap();
        lc.transition(LifecycleState::Closed, Some(CloseReason::Normal))
            .unwrap();

        assert!(lc.transition(LifecycleState::Connected, None).is_err());
        assert!(lc.transition(LifecycleState::Closed, None).is_err());
        assert!(!lc.can_serve_audio());
    }
}
