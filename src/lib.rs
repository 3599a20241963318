//! # Babelcast Backend
//!
//! Connection/session lifecycle layer for live translated audio broadcast:
//! one authenticated speaker, many anonymous listeners, each picking a target
//! language, over WebSocket connections that outlive the transport's ~2h
//! ceiling via make-before-break refreshes.
//!
//! ## Architecture:
//! - **auth**: token validation + speaker/listener classification
//! - **session**: Session/Connection records, store contract, admission registry
//! - **lifecycle**: per-connection state machine + refresh coordinator
//! - **audio**: capture ring buffer and ordered playback queue
//! - **broadcast**: per-language fan-out with stream sequence numbers
//! - **protocol**: the JSON WebSocket envelope
//! - **websocket**: the server-side connection actor
//! - **client**: speaker/listener client sessions built on the same envelope
//! - **handlers / health / middleware / state / config / error**: the HTTP
//!   surface and ambient plumbing

pub mod audio;
pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod lifecycle;
pub mod middleware;
pub mod protocol;
pub mod session;
pub mod state;
pub mod translator;
pub mod websocket;

pub use config::AppConfig;
pub use state::AppState;
