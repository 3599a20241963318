//! # Client Sessions
//!
//! The client half of the broadcast protocol, built on `tokio-tungstenite`.
//!
//! ## Key Components:
//! - **transport**: one WebSocket connection speaking the JSON envelope
//! - **speaker**: pumps captured PCM through the CaptureBuffer into whichever
//!   connection is currently authoritative
//! - **listener**: feeds received chunks into the PlaybackQueue, which makes
//!   the connection refresh inaudible
//!
//! Both clients execute the peer side of the refresh protocol: on
//! `connectionRefreshRequired` they open the parallel connection, and on
//! `connectionRefreshComplete` they atomically redirect audio flow to it and
//! close the old socket (the acknowledgement the server waits for).

pub mod listener;
pub mod speaker;
pub mod transport;

pub use listener::{ListenerClient, ListenerCommand, ListenerConfig, ListenerEvent};
pub use speaker::{SpeakerClient, SpeakerConfig, SpeakerEvent};
pub use transport::{ClientConnection, ClientEvent};
