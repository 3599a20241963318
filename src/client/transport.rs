//! # Client Transport
//!
//! One WebSocket connection from the client side: sends envelopes and binary
//! audio, surfaces decoded server envelopes and the close handshake.

use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// What the connection surfaces to the client loop.
#[derive(Debug)]
pub enum ClientEvent {
    Message(ServerMessage),

    /// Close frame from the server (1000 normal, 1008 refused)
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// One live client-side connection.
pub struct ClientConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ClientConnection {
    /// Connect, passing the bearer credential as the `token` query parameter
    /// (browser WebSocket clients cannot set headers, so the server accepts
    /// both forms).
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self, TransportError> {
        let url = match token {
            Some(token) => {
                let separator = if url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", url, separator, token)
            }
            None => url.to_string(),
        };
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("Client connection established");
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(message)?;
        self.stream
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Binary PCM frame (speaker path).
    pub async fn send_audio(&mut self, pcm: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Binary(pcm))
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Next meaningful event. Pings are answered inline; None means the
    /// stream ended without a close frame (abnormal, code 1006 territory).
    pub async fn next_event(&mut self) -> Option<Result<ClientEvent, TransportError>> {
        while let Some(frame) = self.stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    return Some(
                        serde_json::from_str::<ServerMessage>(&text)
                            .map(ClientEvent::Message)
                            .map_err(TransportError::from),
                    );
                }
                Ok(WsMessage::Ping(payload)) => {
                    let _ = self.stream.send(WsMessage::Pong(payload)).await;
                }
                Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Binary(_)) => {
                    // The server never sends binary frames
                }
                Ok(WsMessage::Close(frame)) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code));
                    let reason = frame.map(|f| f.reason.to_string());
                    return Some(Ok(ClientEvent::Closed { code, reason }));
                }
                Ok(WsMessage::Frame(_)) => {}
                Err(err) => return Some(Err(TransportError::Protocol(err.to_string()))),
            }
        }
        None
    }

    /// Clean close handshake.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
