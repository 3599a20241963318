//! # WebSocket Connection Handler
//!
//! One actor per live WebSocket connection — the "one worker per connection"
//! of the concurrency model. The actor owns its LifecycleCoordinator for the
//! lifetime of the socket and is the only place that mutates it.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects to `/ws`, optionally carrying a bearer
//!    token (Authorization header or `token` query parameter)
//! 2. **Admission**: first envelope is `joinSession` (or `refreshConnection`
//!    for the successor of a refresh window); authorization runs
//!    unconditionally, then the registry admits and the record is persisted
//!    before `sessionJoined` is sent
//! 3. **Audio**: the speaker sends binary PCM frames; listeners receive
//!    `audioData` envelopes
//! 4. **Heartbeat**: `heartbeat` envelopes and ws-level pong both count as
//!    liveness; a peer silent for 3x the interval is presumed gone
//! 5. **Refresh**: at the refresh threshold the actor enters REFRESHING and
//!    hands the window to the RefreshCoordinator while traffic keeps flowing

use crate::broadcast::{BroadcastNotice, ServerPush};
use crate::config::AppConfig;
use crate::error::{AdmissionError, AuthError};
use crate::lifecycle::coordinator::LifecycleCoordinator;
use crate::lifecycle::events::{CloseReason, LifecycleState};
use crate::lifecycle::refresh::RefreshSignal;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::model::{Connection, ConnectionRole, Session};
use crate::session::registry::AdmitRequest;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// WebSocket actor for one broadcast connection.
pub struct BroadcastWebSocket {
    state: AppState,

    /// Configuration snapshot taken at connect time
    config: AppConfig,

    /// State machine for this connection; all mutation happens on this actor
    lifecycle: LifecycleCoordinator,

    /// Registry record, present once admitted
    connection: Option<Connection>,

    /// Session snapshot taken at admission (source language for translation)
    session: Option<Session>,

    bearer_token: Option<String>,

    last_heartbeat: Instant,

    /// Switch instruction delivered; the peer is expected to close
    pending_supersede: bool,

    /// Peer sent a close frame (clean disconnect)
    peer_closed: bool,
}

impl BroadcastWebSocket {
    pub fn new(state: AppState, bearer_token: Option<String>) -> Self {
        let config = state.get_config();
        let connection_id = Connection::assign_id();
        let lifecycle =
            LifecycleCoordinator::new(connection_id, Some(state.lifecycle_events.clone()));
        Self {
            state,
            config,
            lifecycle,
            connection: None,
            session: None,
            bearer_token,
            last_heartbeat: Instant::now(),
            pending_supersede: false,
            peer_closed: false,
        }
    }

    fn send_server(&self, ctx: &mut ws::WebsocketContext<Self>, message: ServerMessage) {
        match serde_json::to_string(&message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "Failed to encode server message"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code = code, message = message, "WebSocket error sent to peer");
        self.send_server(
            ctx,
            ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Run authorization + admission off the actor, reporting back via
    /// `AdmissionReady`. The authorizer is invoked for every attempt,
    /// token or not.
    fn start_admission(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        session_id: String,
        target_language: Option<String>,
        refreshed_from: Option<String>,
    ) {
        if self.connection.is_some() {
            self.send_error(ctx, "already_joined", "Connection already joined a session");
            return;
        }

        let authorizer = self.state.authorizer.clone();
        let registry = self.state.registry.clone();
        let store = self.state.store.clone();
        let token = self.bearer_token.clone();
        let connection_id = self.lifecycle.connection_id().to_string();
        let addr = ctx.address();

        tokio::spawn(async move {
            let principal = match authorizer.authorize(token.as_deref()).await {
                Ok(principal) => principal,
                Err(err) => {
                    addr.do_send(AdmissionReady {
                        result: Err(AdmissionFailure::Auth(err)),
                        refreshed_from: None,
                    });
                    return;
                }
            };

            let request = AdmitRequest {
                connection_id,
                session_id: session_id.clone(),
                principal,
                target_language,
            };
            let admitted = match &refreshed_from {
                None => registry.admit(request).await,
                Some(previous) => registry.admit_refresh(previous, request).await,
            };

            match admitted {
                Ok(connection) => match store.get_session(&session_id).await.ok().flatten() {
                    Some(session) => addr.do_send(AdmissionReady {
                        result: Ok(Box::new((connection, session))),
                        refreshed_from,
                    }),
                    None => addr.do_send(AdmissionReady {
                        result: Err(AdmissionFailure::Admission(
                            AdmissionError::SessionNotFound(session_id),
                        )),
                        refreshed_from: None,
                    }),
                },
                Err(err) => addr.do_send(AdmissionReady {
                    result: Err(AdmissionFailure::Admission(err)),
                    refreshed_from: None,
                }),
            }
        });
    }

    /// Reached the refresh threshold: keep serving, open the window.
    fn begin_refresh(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        if self.lifecycle.state() != LifecycleState::Connected {
            return;
        }
        if self.lifecycle.transition(LifecycleState::Refreshing, None).is_err() {
            return;
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let window = self.state.refresh.begin(&connection, signal_tx);
        debug!(
            connection_id = %connection.connection_id,
            started_at = %window.started_at,
            "Entered refreshing state"
        );
        ctx.add_stream(UnboundedReceiverStream::new(signal_rx));
    }

    /// Grace period after the switch expired without the peer closing.
    fn close_superseded(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.lifecycle.is_closed() {
            return;
        }
        let _ = self
            .lifecycle
            .transition(LifecycleState::Closed, Some(CloseReason::Superseded));
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Normal,
            description: Some(CloseReason::Superseded.describe()),
        }));
        ctx.stop();
    }

    /// Binary frame from the speaker: validate, translate, fan out.
    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(connection) = &self.connection else {
            self.send_error(ctx, "not_joined", "Join a session before sending audio");
            return;
        };
        if connection.role != ConnectionRole::Speaker {
            self.send_error(ctx, "not_speaker", "Only the speaker sends audio");
            return;
        }
        if !self.lifecycle.can_serve_audio() {
            return;
        }
        if data.is_empty() || data.len() % 2 != 0 {
            self.send_error(ctx, "invalid_audio", "Audio frames must be non-empty 16-bit PCM");
            return;
        }
        let Some(session) = &self.session else {
            return;
        };

        let state = self.state.clone();
        let session_id = connection.session_id.clone();
        let source_language = session.source_language.clone();
        let pcm = data.to_vec();

        tokio::spawn(async move {
            let languages = state.broadcaster.active_languages(&session_id);
            if languages.is_empty() {
                return;
            }
            match state
                .translator
                .translate(&session_id, &source_language, &languages, &pcm)
                .await
            {
                Ok(chunks) => {
                    let delivered = state.broadcaster.publish(&session_id, chunks);
                    state.record_chunks_delivered(delivered as u64);
                }
                Err(err) => error!(session_id = %session_id, error = %err, "Translation failed"),
            }
        });
    }

    /// Listener switches streams. The client flushes its playback queue; the
    /// server rewrites the record and re-confirms with `sessionJoined`.
    fn handle_change_language(
        &mut self,
        ctx: &mut ws::WebsocketContext<Self>,
        target_language: String,
    ) {
        let Some(connection) = &self.connection else {
            self.send_error(ctx, "not_joined", "Join a session before changing language");
            return;
        };
        if connection.role != ConnectionRole::Listener {
            self.send_error(ctx, "not_listener", "Only listeners select a language");
            return;
        }

        let registry = self.state.registry.clone();
        let broadcaster = self.state.broadcaster.clone();
        let session_id = connection.session_id.clone();
        let connection_id = connection.connection_id.clone();
        let addr = ctx.address();

        tokio::spawn(async move {
            match registry.change_language(&connection_id, &target_language).await {
                Ok(()) => {
                    broadcaster.update_language(&session_id, &connection_id, &target_language);
                    addr.do_send(LanguageChanged { target_language });
                }
                Err(err) => addr.do_send(SendServerMessage(ServerMessage::Error {
                    code: err.code().to_string(),
                    message: err.to_string(),
                })),
            }
        });
    }

    fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        if let Some(connection) = &self.connection {
            let registry = self.state.registry.clone();
            let connection_id = connection.connection_id.clone();
            tokio::spawn(async move {
                registry.touch(&connection_id).await;
            });
        }
    }
}

/// Admission verdict delivered back to the actor.
#[derive(Message)]
#[rtype(result = "()")]
struct AdmissionReady {
    result: Result<Box<(Connection, Session)>, AdmissionFailure>,
    refreshed_from: Option<String>,
}

enum AdmissionFailure {
    Auth(AuthError),
    Admission(AdmissionError),
}

/// Envelope from a spawned task to the peer.
#[derive(Message)]
#[rtype(result = "()")]
struct SendServerMessage(ServerMessage);

/// Language change applied in the registry.
#[derive(Message)]
#[rtype(result = "()")]
struct LanguageChanged {
    target_language: String,
}

impl Actor for BroadcastWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Connection starts in CONNECTING with the heartbeat timer running.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.lifecycle.connection_id(), "WebSocket connection started");

        let deadline = self.config.lifecycle.heartbeat_deadline();
        ctx.run_interval(self.config.lifecycle.heartbeat_interval(), move |act, ctx| {
            if act.lifecycle.is_closed() {
                return;
            }
            if Instant::now().duration_since(act.last_heartbeat) > deadline {
                warn!(
                    connection_id = %act.lifecycle.connection_id(),
                    "Heartbeat deadline missed, peer presumed gone"
                );
                let _ = act
                    .lifecycle
                    .transition(LifecycleState::Closed, Some(CloseReason::HeartbeatTimeout));
                // Abrupt stop: the peer observes 1006 and takes the ordinary
                // reconnect path, not the refresh path
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if !self.lifecycle.is_closed() {
            let reason = if self.pending_supersede {
                CloseReason::Superseded
            } else if self.peer_closed || self.connection.is_none() {
                CloseReason::Normal
            } else {
                CloseReason::TransportError("connection lost".to_string())
            };
            let _ = self.lifecycle.transition(LifecycleState::Closed, Some(reason));
        }

        // Release registry/broadcast state in the background
        if let Some(connection) = self.connection.take() {
            info!(
                connection_id = %connection.connection_id,
                session_id = %connection.session_id,
                "WebSocket connection stopped"
            );
            let state = self.state.clone();
            tokio::spawn(async move {
                state
                    .broadcaster
                    .unregister(&connection.session_id, &connection.connection_id);
                state.refresh.abandon(&connection.connection_id);
                state.registry.release(&connection.connection_id).await;
            });
        }
    }
}

/// Incoming frames from the peer.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for BroadcastWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::JoinSession {
                    session_id,
                    target_language,
                }) => {
                    self.start_admission(ctx, session_id, target_language, None);
                }
                Ok(ClientMessage::RefreshConnection {
                    session_id,
                    role: _,
                    previous_connection_id,
                    target_language,
                }) => {
                    self.start_admission(
                        ctx,
                        session_id,
                        target_language,
                        Some(previous_connection_id),
                    );
                }
                Ok(ClientMessage::Heartbeat) => {
                    self.touch_heartbeat();
                }
                Ok(ClientMessage::ChangeLanguage { target_language }) => {
                    self.handle_change_language(ctx, target_language);
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid envelope: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.touch_heartbeat();
            }
            Ok(ws::Message::Pong(_)) => {
                self.touch_heartbeat();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(
                    connection_id = %self.lifecycle.connection_id(),
                    reason = ?reason,
                    "WebSocket closed by peer"
                );
                self.peer_closed = true;
                if !self.lifecycle.is_closed() {
                    let close_reason = if self.pending_supersede {
                        CloseReason::Superseded
                    } else {
                        CloseReason::Normal
                    };
                    let _ = self
                        .lifecycle
                        .transition(LifecycleState::Closed, Some(close_reason));
                }
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                let _ = self.lifecycle.transition(
                    LifecycleState::Closed,
                    Some(CloseReason::TransportError(err.to_string())),
                );
                ctx.stop();
            }
        }
    }
}

/// Outbound pushes from the broadcaster.
impl StreamHandler<ServerPush> for BroadcastWebSocket {
    fn handle(&mut self, push: ServerPush, ctx: &mut Self::Context) {
        match push {
            ServerPush::Audio(chunk) => {
                self.send_server(ctx, ServerMessage::AudioData { chunk });
            }
            ServerPush::Notice(notice) => {
                self.send_server(ctx, ServerMessage::from(notice));
                if notice == BroadcastNotice::SessionEnded {
                    let _ = self
                        .lifecycle
                        .transition(LifecycleState::Closed, Some(CloseReason::SessionEnded));
                    ctx.close(Some(ws::CloseReason {
                        code: ws::CloseCode::Normal,
                        description: Some(CloseReason::SessionEnded.describe()),
                    }));
                    ctx.stop();
                }
            }
        }
    }

    /// The broadcaster dropped our channel (session torn down); the close
    /// path is driven by the SessionEnded notice, not by stream end.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Control signals from the RefreshCoordinator (old-connection side).
impl StreamHandler<RefreshSignal> for BroadcastWebSocket {
    fn handle(&mut self, signal: RefreshSignal, ctx: &mut Self::Context) {
        match signal {
            RefreshSignal::RefreshRequired {
                refresh_at,
                warning_at,
                attempt,
            } => {
                debug!(
                    connection_id = %self.lifecycle.connection_id(),
                    attempt,
                    "Requesting connection refresh from peer"
                );
                self.send_server(
                    ctx,
                    ServerMessage::ConnectionRefreshRequired {
                        refresh_at: refresh_at.timestamp_millis() as u64,
                        warning_at: warning_at.timestamp_millis() as u64,
                    },
                );
            }
            RefreshSignal::Switched { new_connection_id } => {
                self.send_server(
                    ctx,
                    ServerMessage::ConnectionRefreshComplete { new_connection_id },
                );
                self.pending_supersede = true;
                // Retire after the peer acknowledges by closing, or after the
                // bounded grace period
                ctx.run_later(self.config.lifecycle.supersede_grace(), |act, ctx| {
                    act.close_superseded(ctx)
                });
            }
        }
    }

    /// Window abandoned; not fatal for the connection.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<AdmissionReady> for BroadcastWebSocket {
    type Result = ();

    fn handle(&mut self, msg: AdmissionReady, ctx: &mut Self::Context) {
        match msg.result {
            Ok(admitted) => {
                let (connection, session) = *admitted;
                if self.lifecycle.transition(LifecycleState::Connected, None).is_err() {
                    // The actor closed while admission was in flight (e.g.
                    // heartbeat timeout); the record must not outlive it
                    let registry = self.state.registry.clone();
                    let orphan = connection.connection_id.clone();
                    tokio::spawn(async move {
                        registry.release(&orphan).await;
                    });
                    return;
                }

                // Register for delivery before confirming admission
                let (push_tx, push_rx) = mpsc::unbounded_channel();
                self.state.broadcaster.register(&connection, push_tx);
                ctx.add_stream(UnboundedReceiverStream::new(push_rx));

                // Advance notice and the hard threshold, on this connection's
                // own clock
                let margin =
                    chrono::Duration::seconds(self.config.lifecycle.refresh_margin_secs as i64);
                let refresh_at = (connection.expires_at - margin).timestamp_millis() as u64;
                let warning_at = refresh_at
                    - self.config.lifecycle.refresh_warning_secs * 1000;
                ctx.run_later(self.config.lifecycle.refresh_warning_at(), move |act, ctx| {
                    act.send_server(
                        ctx,
                        ServerMessage::ConnectionRefreshRequired {
                            refresh_at,
                            warning_at,
                        },
                    );
                });
                ctx.run_later(self.config.lifecycle.refresh_threshold(), |act, ctx| {
                    act.begin_refresh(ctx)
                });

                // Successor of a refresh window: confirm the switch so the
                // predecessor can retire
                if let Some(previous_id) = msg.refreshed_from {
                    let refresh = self.state.refresh.clone();
                    let new_id = connection.connection_id.clone();
                    tokio::spawn(async move {
                        if let Err(err) = refresh.successor_connected(&previous_id, &new_id).await
                        {
                            warn!(
                                old_connection_id = %previous_id,
                                error = %err,
                                "Switch confirmation failed"
                            );
                        }
                    });
                }

                self.send_server(
                    ctx,
                    ServerMessage::SessionJoined {
                        session_id: session.session_id.clone(),
                        connection_id: connection.connection_id.clone(),
                        role: connection.role,
                        target_language: connection.target_language.clone(),
                        generation: connection.generation,
                    },
                );
                self.session = Some(session);
                self.connection = Some(connection);
            }
            Err(failure) => {
                let (code, message, reason) = match failure {
                    AdmissionFailure::Auth(err) => (
                        err.code(),
                        err.to_string(),
                        CloseReason::AuthRefused(err.to_string()),
                    ),
                    AdmissionFailure::Admission(err) => (
                        err.code(),
                        err.to_string(),
                        CloseReason::AdmissionRefused(err.to_string()),
                    ),
                };
                let _ = self.lifecycle.transition(LifecycleState::Closed, Some(reason));

                // Refused with the reason surfaced before the socket closes;
                // never silently downgraded to a different role
                self.send_server(
                    ctx,
                    ServerMessage::Error {
                        code: code.to_string(),
                        message: message.clone(),
                    },
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some(message),
                }));
                ctx.stop();
            }
        }
    }
}

impl Handler<SendServerMessage> for BroadcastWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendServerMessage, ctx: &mut Self::Context) {
        self.send_server(ctx, msg.0);
    }
}

impl Handler<LanguageChanged> for BroadcastWebSocket {
    type Result = ();

    fn handle(&mut self, msg: LanguageChanged, ctx: &mut Self::Context) {
        if let Some(connection) = &mut self.connection {
            connection.target_language = Some(msg.target_language);
            let confirmation = ServerMessage::SessionJoined {
                session_id: connection.session_id.clone(),
                connection_id: connection.connection_id.clone(),
                role: connection.role,
                target_language: connection.target_language.clone(),
                generation: connection.generation,
            };
            self.send_server(ctx, confirmation);
        }
    }
}

/// HTTP → WebSocket upgrade endpoint.
pub async fn broadcast_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );
    let token = bearer_token(&req);
    let websocket = BroadcastWebSocket::new(app_state.get_ref().clone(), token);
    ws::start(websocket, &req, stream)
}

/// Bearer credential from the Authorization header, falling back to the
/// `token` query parameter (browser WebSocket clients cannot set headers).
fn bearer_token(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req.headers().get(actix_web::http::header::AUTHORIZATION) {
        if let Ok(header) = value.to_str() {
            if let Some(token) = header.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    web::Query::<HashMap<String, String>>::from_query(req.query_string())
        .ok()
        .and_then(|query| query.get("token").cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn bearer_token_prefers_the_authorization_header() {
        let req = TestRequest::default()
            .insert_header((actix_web::http::header::AUTHORIZATION, "Bearer abc123"))
            .uri("/ws?token=from-query")
            .to_http_request();
        assert_eq!(bearer_token(&req), Some("abc123".to_string()));
    }

    #[test]
    fn bearer_token_falls_back_to_the_query_parameter() {
        let req = TestRequest::default()
            .uri("/ws?token=from-query")
            .to_http_request();
        assert_eq!(bearer_token(&req), Some("from-query".to_string()));
    }

    #[test]
    fn no_credential_is_a_valid_anonymous_attempt() {
        let req = TestRequest::default().uri("/ws").to_http_request();
        assert_eq!(bearer_token(&req), None);
    }
}
