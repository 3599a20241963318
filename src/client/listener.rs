//! # Listener Client
//!
//! Joins a session anonymously, feeds every received chunk into the
//! PlaybackQueue, and executes the peer side of the connection refresh.
//! Because the queue orders by sequence number and deduplicates, chunks may
//! arrive through the old connection, the new one, or both — playback never
//! hears the difference.
//!
//! ## Language Change:
//! `changeLanguage` is confirmed by the server with a fresh `sessionJoined`;
//! the queue is then flushed and reset — buffered audio of the old stream is
//! discarded, never blended into the new one.

use crate::audio::playback::{HttpChunkFetcher, PlaybackQueue};
use crate::client::transport::{ClientConnection, ClientEvent};
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::model::ConnectionRole;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Listener session settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// WebSocket endpoint, e.g. "ws://host:8080/ws"
    pub url: String,
    pub session_id: String,
    pub target_language: String,
    pub playback: crate::audio::playback::PlaybackQueueConfig,
    pub heartbeat_interval: Duration,
}

/// What the embedding application observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Joined {
        connection_id: String,
        target_language: Option<String>,
    },
    /// The refresh switch completed on a new connection
    Refreshed { connection_id: String },
    Paused,
    Resumed,
    Muted,
    Unmuted,
    Ended,
    ServerError { code: String, message: String },
}

/// Control inputs from the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerCommand {
    ChangeLanguage(String),
    Close,
}

/// Which physical connection a message arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Active,
    Pending,
}

/// Follow-up work decided by message handling, executed by the run loop.
#[derive(Debug, PartialEq)]
enum Action {
    OpenSuccessor,
    SwitchToSuccessor { new_connection_id: String },
    CloseSelf,
}

pub struct ListenerClient {
    config: ListenerConfig,
    queue: Arc<PlaybackQueue>,
    events: UnboundedSender<ListenerEvent>,
    connection_id: Option<String>,
    /// Successor's connection id, once its admission confirms
    pending_id: Option<String>,
    /// A language change is in flight; the next confirmation flushes
    awaiting_flush: bool,
}

impl ListenerClient {
    pub fn new(config: ListenerConfig) -> (Self, UnboundedReceiver<ListenerEvent>) {
        let (events, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let queue = Arc::new(PlaybackQueue::new(config.playback.clone()));
        (
            Self {
                config,
                queue,
                events,
                connection_id: None,
                pending_id: None,
                awaiting_flush: false,
            },
            events_rx,
        )
    }

    /// The playback side: drain this queue for the audio sink.
    pub fn queue(&self) -> Arc<PlaybackQueue> {
        self.queue.clone()
    }

    /// Drive the session until it ends, the server refuses it, or `Close` is
    /// commanded.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<ListenerCommand>,
    ) -> Result<(), TransportError> {
        let fetcher = HttpChunkFetcher::new();
        let mut active = ClientConnection::connect(&self.config.url, None).await?;
        active
            .send(&ClientMessage::JoinSession {
                session_id: self.config.session_id.clone(),
                target_language: Some(self.config.target_language.clone()),
            })
            .await?;

        let mut pending: Option<ClientConnection> = None;
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = active.next_event() => {
                    match event {
                        Some(Ok(ClientEvent::Message(message))) => {
                            for action in self.handle_message(Origin::Active, message) {
                                match action {
                                    Action::OpenSuccessor => {
                                        if pending.is_none() {
                                            match self.open_successor().await {
                                                Ok(conn) => pending = Some(conn),
                                                // The old connection stays up;
                                                // the server re-requests
                                                Err(err) => warn!(error = %err, "Successor connect failed"),
                                            }
                                        }
                                    }
                                    Action::SwitchToSuccessor { new_connection_id } => {
                                        if let Some(next) = pending.take() {
                                            let old = std::mem::replace(&mut active, next);
                                            // Closing the old socket is the
                                            // switch acknowledgement
                                            tokio::spawn(old.close());
                                            self.connection_id = Some(new_connection_id.clone());
                                            self.pending_id = None;
                                            let _ = self.events.send(ListenerEvent::Refreshed {
                                                connection_id: new_connection_id,
                                            });
                                        }
                                    }
                                    Action::CloseSelf => {
                                        active.close().await;
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Some(Ok(ClientEvent::Closed { code, .. })) | Some(Err(TransportError::ClosedUnexpectedly(code))) => {
                            if let Some(next) = pending.take() {
                                // The refresh raced our switch; carry on
                                // through the successor
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
                        Some(Ok(ClientEvent::Message(message))) => {
                            for action in self.handle_message(Origin::Pending, message) {
                                if let Action::SwitchToSuccessor { .. } = action {
                                    debug!("Switch instruction arrived on the successor; waiting for the active side");
                                }
                            }
                        }
                        Some(Ok(ClientEvent::Closed { .. })) | Some(Err(_)) | None => {
                            // Successor failed; the window retries while the
                            // old connection keeps serving
                            pending = None;
                            self.pending_id = None;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(ListenerCommand::ChangeLanguage(target_language)) => {
                            self.awaiting_flush = true;
                            active
                                .send(&ClientMessage::ChangeLanguage { target_language })
                                .await?;
                        }
                        Some(ListenerCommand::Close) | None => {
                            active.close().await;
                            return Ok(());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    active.send(&ClientMessage::Heartbeat).await?;
                }
            }

            // Resolve pointer payloads inside the look-ahead window
            self.queue.prefetch(&fetcher).await;
        }
    }

    /// Pure message handling; the run loop performs the returned actions.
    fn handle_message(&mut self, origin: Origin, message: ServerMessage) -> Vec<Action> {
        match message {
            ServerMessage::SessionJoined {
                connection_id,
                target_language,
                ..
            } => {
                match origin {
                    Origin::Pending => {
                        // Successor admitted; the switch instruction will
                        // arrive on the active connection
                        self.pending_id = Some(connection_id);
                    }
                    Origin::Active => {
                        if self.awaiting_flush {
                            // Language change confirmed: discard the old
                            // stream entirely before the new one starts
                            self.queue.reset();
                            self.awaiting_flush = false;
                        }
                        self.connection_id = Some(connection_id.clone());
                        let _ = self.events.send(ListenerEvent::Joined {
                            connection_id,
                            target_language,
                        });
                    }
                }
                Vec::new()
            }
            ServerMessage::ConnectionRefreshRequired { .. } => vec![Action::OpenSuccessor],
            ServerMessage::ConnectionRefreshComplete { new_connection_id } => {
                vec![Action::SwitchToSuccessor { new_connection_id }]
            }
            ServerMessage::AudioData { chunk } => {
                // Either connection may carry the stream during the window;
                // ordering and dedup live in the queue
                self.queue.enqueue(chunk);
                Vec::new()
            }
            ServerMessage::SessionEnded => {
                info!("Session ended by the speaker");
                let _ = self.events.send(ListenerEvent::Ended);
                vec![Action::CloseSelf]
            }
            ServerMessage::BroadcastPaused => {
                let _ = self.events.send(ListenerEvent::Paused);
                Vec::new()
            }
            ServerMessage::BroadcastResumed => {
                let _ = self.events.send(ListenerEvent::Resumed);
                Vec::new()
            }
            ServerMessage::BroadcastMuted => {
                let _ = self.events.send(ListenerEvent::Muted);
                Vec::new()
            }
            ServerMessage::BroadcastUnmuted => {
                let _ = self.events.send(ListenerEvent::Unmuted);
                Vec::new()
            }
            ServerMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Server error");
                let _ = self
                    .events
                    .send(ListenerEvent::ServerError { code, message });
                Vec::new()
            }
        }
    }

    async fn open_successor(&self) -> Result<ClientConnection, TransportError> {
        let previous = self.connection_id.clone().unwrap_or_default();
        let mut conn = ClientConnection::connect(&self.config.url, None).await?;
        conn.send(&ClientMessage::RefreshConnection {
            session_id: self.config.session_id.clone(),
            role: ConnectionRole::Listener,
            previous_connection_id: previous,
            target_language: Some(self.config.target_language.clone()),
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
    use crate::audio::chunk::AudioChunk;
    use crate::audio::playback::PlaybackQueueConfig;

    fn client() -> (ListenerClient, UnboundedReceiver<ListenerEvent>) {
        ListenerClient::new(ListenerConfig {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            session_id: "golden-eagle-427".to_string(),
            target_language: "es".to_string(),
            playback: PlaybackQueueConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
        })
    }

    fn audio(seq: u64) -> ServerMessage {
        ServerMessage::AudioData {
            chunk: AudioChunk::inline(seq, 200, &[0u8; 4]),
        }
    }

    fn joined(connection_id: &str) -> ServerMessage {
        ServerMessage::SessionJoined {
            session_id: "golden-eagle-427".to_string(),
            connection_id: connection_id.to_string(),
            role: ConnectionRole::Listener,
            target_language: Some("es".to_string()),
            generation: 1,
        }
    }

    #[tokio::test]
    async fn refresh_switch_is_gapless_and_duplicate_free() {
        let (mut client, mut events) = client();
        let queue = client.queue();

        client.handle_message(Origin::Active, joined("old-conn"));
        assert!(matches!(
            events.try_recv().unwrap(),
            ListenerEvent::Joined { .. }
        ));

        // Chunks 100..=110 arrive on the old connection
        for seq in 100..=110 {
            client.handle_message(Origin::Active, audio(seq));
        }

        // Refresh requested: the client decides to open the successor
        let actions =
            client.handle_message(Origin::Active, ServerMessage::ConnectionRefreshRequired {
                refresh_at: 0,
                warning_at: 0,
            });
        assert_eq!(actions, vec![Action::OpenSuccessor]);

        // Successor admitted on its own socket
        client.handle_message(Origin::Pending, joined("new-conn"));
        assert_eq!(client.pending_id.as_deref(), Some("new-conn"));

        // The window races: both connections deliver 108..=112
        for seq in 108..=112 {
            client.handle_message(Origin::Pending, audio(seq));
        }

        // Switch instruction arrives on the old connection
        let actions = client.handle_message(
            Origin::Active,
            ServerMessage::ConnectionRefreshComplete {
                new_connection_id: "new-conn".to_string(),
            },
        );
        assert_eq!(
            actions,
            vec![Action::SwitchToSuccessor {
                new_connection_id: "new-conn".to_string()
            }]
        );

        // Remainder arrives on the new connection only
        for seq in 113..=120 {
            client.handle_message(Origin::Pending, audio(seq));
        }

        // Playback sees exactly 100..=120, strictly increasing
        for expected in 100..=120u64 {
            let ready = queue
                .next_ready(Duration::from_millis(20))
                .await
                .expect("chunk ready");
            assert_eq!(ready.chunk.sequence_number, expected);
        }
        assert!(queue.next_ready(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn language_change_confirmation_flushes_the_queue() {
        let (mut client, _events) = client();
        let queue = client.queue();

        client.handle_message(Origin::Active, joined("conn-1"));
        for seq in 1..=5 {
            client.handle_message(Origin::Active, audio(seq));
        }
        assert_eq!(queue.len(), 5);

        // Change requested (the run loop sends the envelope); confirmation
        // arrives as a fresh sessionJoined
        client.awaiting_flush = true;
        client.handle_message(Origin::Active, joined("conn-1"));

        assert_eq!(queue.len(), 0);
        assert!(!client.awaiting_flush);

        // The new stream restarts numbering
        client.handle_message(Origin::Active, audio(1));
        assert_eq!(
            queue
                .next_ready(Duration::from_millis(20))
                .await
                .unwrap()
                .chunk
                .sequence_number,
            1
        );
    }

    #[tokio::test]
    async fn session_end_closes_the_client() {
        let (mut client, mut events) = client();
        client.handle_message(Origin::Active, joined("conn-1"));
        let _ = events.try_recv();

        let actions = client.handle_message(Origin::Active, ServerMessage::SessionEnded);
        assert_eq!(actions, vec![Action::CloseSelf]);
        assert_eq!(events.try_recv().unwrap(), ListenerEvent::Ended);
    }
}
