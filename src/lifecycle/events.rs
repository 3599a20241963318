//! # Lifecycle Events
//!
//! Every state transition of every connection is observable: the coordinator
//! emits a typed `LifecycleEvent` on a channel consumed by metrics and tests.
//! Events are an enum end-to-end — no stringly-typed event names to mismatch.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;

/// States of one connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Transport accepted; authorization + admission in progress
    Connecting,

    /// Serving audio, heartbeat running
    Connected,

    /// Still serving while the successor connection is stood up
    Refreshing,

    /// Terminal; registry record released
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Connecting => "connecting",
            LifecycleState::Connected => "connected",
            LifecycleState::Refreshing => "refreshing",
            LifecycleState::Closed => "closed",
        }
    }
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Peer closed cleanly
    Normal,

    /// Retired in favor of its refresh successor — not an error
    Superseded,

    /// No heartbeat within the deadline; peer presumed gone
    HeartbeatTimeout,

    /// Authorizer denied the attempt
    AuthRefused(String),

    /// Registry refused the attempt
    AdmissionRefused(String),

    /// The session the connection belonged to ended
    SessionEnded,

    /// Socket-level failure
    TransportError(String),
}

impl CloseReason {
    pub fn describe(&self) -> String {
        match self {
            CloseReason::Normal => "Normal".to_string(),
            CloseReason::Superseded => "Superseded".to_string(),
            CloseReason::HeartbeatTimeout => "Heartbeat timeout".to_string(),
            CloseReason::AuthRefused(msg) => msg.clone(),
            CloseReason::AdmissionRefused(msg) => msg.clone(),
            CloseReason::SessionEnded => "Session ended".to_string(),
            CloseReason::TransportError(msg) => msg.clone(),
        }
    }
}

/// One observed transition.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub connection_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: Option<CloseReason>,
    pub at: DateTime<Utc>,
}

pub type LifecycleEventSender = UnboundedSender<LifecycleEvent>;
