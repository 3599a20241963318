//! # Connection Lifecycle
//!
//! The per-connection state machine and the make-before-break refresh that
//! keeps a multi-hour session alive across a transport hard-capped at ~2h.
//!
//! ## Key Components:
//! - **events**: typed lifecycle transitions, observable on a channel
//! - **coordinator**: `Connecting → Connected → Refreshing → Closed` per
//!   connection, heartbeat deadline, refresh threshold
//! - **refresh**: stands up the successor connection, switches audio flow,
//!   retires the predecessor

pub mod coordinator;
pub mod events;
pub mod refresh;

pub use coordinator::LifecycleCoordinator;
pub use events::{CloseReason, LifecycleEvent, LifecycleEventSender, LifecycleState};
pub use refresh::{RefreshCoordinator, RefreshSignal, RefreshWindow, RefreshWindowState};
