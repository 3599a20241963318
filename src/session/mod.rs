//! # Session & Connection Registry
//!
//! Durable view of who is broadcasting and who is connected.
//!
//! ## Key Components:
//! - **model**: Session and Connection records
//! - **store**: the SessionStore contract (CRUD + atomic conditional writes)
//!   and its in-memory implementation
//! - **registry**: role-correct admission, heartbeat touch, release
//! - **slug**: human-readable session identifiers ("golden-eagle-427")
//!
//! The ConnectionRegistry is the sole writer of Connection records; every
//! other component reads through it. There are no process-wide mutable
//! globals — the registry is constructed once and passed by handle.

pub mod model;
pub mod registry;
pub mod slug;
pub mod store;

pub use model::{Connection, ConnectionRole, Session, SessionStatus};
pub use registry::{AdmitRequest, ConnectionRegistry};
pub use store::{MemorySessionStore, SessionStore, StoreError};
