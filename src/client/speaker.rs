//! # Speaker Client
//!
//! Pumps a captured PCM stream through the CaptureBuffer into whichever
//! connection is currently authoritative. Capture never stops for a refresh:
//! the ring buffer absorbs whatever the socket cannot take, and the switch
//! just redirects where frames drain to.

use crate::audio::capture::CaptureBuffer;
use crate::client::transport::{ClientConnection, ClientEvent};
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::model::ConnectionRole;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Speaker session settings.
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// WebSocket endpoint, e.g. "ws://host:8080/ws"
    pub url: String,
    /// Bearer credential; the speaker path is never anonymous
    pub token: String,
    pub session_id: String,
    pub capture: crate::audio::capture::CaptureBufferConfig,
    pub heartbeat_interval: Duration,
}

/// What the embedding application observes.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeakerEvent {
    Joined { connection_id: String },
    /// The refresh switch completed on a new connection
    Refreshed { connection_id: String },
    /// The capture ring is near capacity; pause the microphone
    NearCapacity,
    /// Unread audio was evicted
    Overflow { dropped_ms: u64 },
    Ended,
    ServerError { code: String, message: String },
}

pub struct SpeakerClient {
    config: SpeakerConfig,
    capture: Arc<CaptureBuffer>,
    events: UnboundedSender<SpeakerEvent>,
    connection_id: Option<String>,
    pending_id: Option<String>,
}

impl SpeakerClient {
    pub fn new(config: SpeakerConfig) -> (Self, UnboundedReceiver<SpeakerEvent>) {
        let (events, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let capture = Arc::new(CaptureBuffer::new(config.capture.clone()));
        (
            Self {
                config,
                capture,
                events,
                connection_id: None,
                pending_id: None,
            },
            events_rx,
        )
    }

    pub fn capture(&self) -> Arc<CaptureBuffer> {
        self.capture.clone()
    }

    /// Broadcast the PCM source until it ends, the session ends, or the
    /// transport is lost.
    pub async fn run(
        mut self,
        mut source: impl Stream<Item = Vec<u8>> + Unpin,
    ) -> Result<(), TransportError> {
        let mut active = ClientConnection::connect(&self.config.url, Some(&self.config.token)).await?;
        active
            .send(&ClientMessage::JoinSession {
                session_id: self.config.session_id.clone(),
                target_language: None,
            })
            .await?;

        let mut pending: Option<ClientConnection> = None;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                captured = source.next() => {
                    match captured {
                        Some(pcm) => {
                            match self.capture.write(&pcm) {
                                Ok(outcome) => {
                                    if let Some(overflow) = outcome.overflow {
                                        let _ = self.events.send(SpeakerEvent::Overflow {
                                            dropped_ms: overflow.dropped_ms,
                                        });
                                    } else if outcome.near_capacity {
                                        let _ = self.events.send(SpeakerEvent::NearCapacity);
                                    }
                                }
                                Err(err) => {
                                    warn!(error = %err, "Dropping invalid capture data");
                                    continue;
                                }
                            }
                            // Drain through whichever connection currently
                            // owns the audio flow
                            while let Some(frame) = self.capture.drain_frame() {
                                active.send_audio(frame).await?;
                            }
                        }
                        None => {
                            info!("Capture source ended, closing broadcast");
                            active.close().await;
                            return Ok(());
                        }
                    }
                }
                event = active.next_event() => {
                    match event {
                        Some(Ok(ClientEvent::Message(message))) => {
                            if let Some(result) = self.handle_active_message(message, &mut active, &mut pending).await {
                                return result;
                            }
                        }
                        Some(Ok(ClientEvent::Closed { code, .. })) => {
                            if let Some(next) = pending.take() {
                                active = next;
                                continue;
                            }
                            return Err(TransportError::ClosedUnexpectedly(code));
                        }
                        Some(Err(err)) => return Err(err),
                        None => {
                            if let Some(next) = pending.take() {
                                active = next;
                                continue;
                            }
                            return Err(TransportError::ClosedUnexpectedly(None));
                        }
                    }
                }
                event = poll_pending(&mut pending), if pending.is_some() => {
                    match event {
                        Some(Ok(ClientEvent::Message(ServerMessage::SessionJoined { connection_id, .. }))) => {
                            debug!(connection_id = %connection_id, "Successor connection admitted");
                            self.pending_id = Some(connection_id);
                        }
                        Some(Ok(ClientEvent::Message(_))) => {}
                        Some(Ok(ClientEvent::Closed { .. })) | Some(Err(_)) | None => {
                            // Successor failed; the old connection keeps
                            // broadcasting and the server retries the window
                            pending = None;
                            self.pending_id = None;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    active.send(&ClientMessage::Heartbeat).await?;
                }
            }
        }
    }

    /// Handle one envelope from the active connection. Returns Some(result)
    /// when the run loop should finish.
    async fn handle_active_message(
        &mut self,
        message: ServerMessage,
        active: &mut ClientConnection,
        pending: &mut Option<ClientConnection>,
    ) -> Option<Result<(), TransportError>> {
        match message {
            ServerMessage::SessionJoined { connection_id, .. } => {
                info!(connection_id = %connection_id, "Broadcasting");
                self.connection_id = Some(connection_id.clone());
                let _ = self.events.send(SpeakerEvent::Joined { connection_id });
            }
            ServerMessage::ConnectionRefreshRequired { .. } => {
                if pending.is_none() {
                    match self.open_successor().await {
                        Ok(conn) => *pending = Some(conn),
                        // Old connection stays fully active; the server
                        // re-requests with backoff
                        Err(err) => warn!(error = %err, "Successor connect failed"),
                    }
                }
            }
            ServerMessage::ConnectionRefreshComplete { new_connection_id } => {
                if let Some(next) = pending.take() {
                    let old = std::mem::replace(active, next);
                    // Close acknowledges the switch; capture writes were
                    // never interrupted
                    tokio::spawn(old.close());
                    self.connection_id = Some(new_connection_id.clone());
                    self.pending_id = None;
                    let _ = self.events.send(SpeakerEvent::Refreshed {
                        connection_id: new_connection_id,
                    });
                }
            }
            ServerMessage::SessionEnded => {
                let _ = self.events.send(SpeakerEvent::Ended);
                return Some(Ok(()));
            }
            ServerMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Server error");
                let _ = self.events.send(SpeakerEvent::ServerError { code, message });
            }
            other => {
                debug!(message = ?other, "Ignoring envelope on the speaker path");
            }
        }
        None
    }

    async fn open_successor(&self) -> Result<ClientConnection, TransportError> {
        let previous = self.connection_id.clone().unwrap_or_default();
        let mut conn =
            ClientConnection::connect(&self.config.url, Some(&self.config.token)).await?;
        conn.send(&ClientMessage::RefreshConnection {
            session_id: self.config.session_id.clone(),
            role: ConnectionRole::Speaker,
            previous_connection_id: previous,
            target_language: None,
        })
        .await?;
        Ok(conn)
    }
}

async fn poll_pending(
    pending: &mut Option<ClientConnection>,
) -> Option<Result<ClientEvent, TransportError>> {
    match pending {
        Some(conn) => conn.next_event().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::CaptureBufferConfig;

    #[test]
    fn capture_buffer_is_shared_with_the_embedder() {
        let (client, _events) = SpeakerClient::new(SpeakerConfig {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            token: "t".to_string(),
            session_id: "golden-eagle-427".to_string(),
            capture: CaptureBufferConfig {
                sample_rate: 1000,
                channels: 1,
                capacity_ms: 100,
                frame_duration_ms: 10,
            },
            heartbeat_interval: Duration::from_secs(30),
        });

        let capture = client.capture();
        capture.write(&[0u8; 20]).unwrap();
        assert_eq!(capture.duration_ms(), 10);
        assert!(Arc::ptr_eq(&capture, &client.capture));
    }
}
