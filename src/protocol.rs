//! # Wire Protocol
//!
//! The JSON envelope spoken over the WebSocket, shared by the server actor
//! and the client sessions.
//!
//! ## Message Format:
//! - **Client → Server**: JSON envelopes tagged by `action`; speaker audio
//!   itself travels as binary frames (16-bit LE PCM)
//! - **Server → Client**: JSON envelopes tagged by `type`
//!
//! Everything the server can say is one tagged enum dispatched through a
//! single handler switch on the client — event names cannot drift apart the
//! way stringly-typed emitters let them.

use crate::audio::chunk::AudioChunk;
use crate::broadcast::BroadcastNotice;
use crate::session::model::ConnectionRole;
use serde::{Deserialize, Serialize};

/// Client-originated envelopes, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Admission request
    JoinSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
    },

    /// Liveness touch
    Heartbeat,

    /// Open the parallel connection of a refresh window.
    /// `previous_connection_id` correlates the logical identity so the server
    /// can assign the next generation.
    RefreshConnection {
        session_id: String,
        role: ConnectionRole,
        previous_connection_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
    },

    /// Listener switches streams; the client flushes its playback queue
    ChangeLanguage { target_language: String },
}

/// Server-originated envelopes, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Admission success
    SessionJoined {
        session_id: String,
        connection_id: String,
        role: ConnectionRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
        generation: u64,
    },

    /// Advance notice of the transport ceiling; timestamps in epoch ms
    ConnectionRefreshRequired { refresh_at: u64, warning_at: u64 },

    /// Switch instruction: the successor is live
    ConnectionRefreshComplete { new_connection_id: String },

    /// One audio chunk
    AudioData {
        #[serde(flatten)]
        chunk: AudioChunk,
    },

    /// The speaker ended the session
    SessionEnded,

    BroadcastPaused,
    BroadcastResumed,
    BroadcastMuted,
    BroadcastUnmuted,

    /// Admission or runtime failure
    Error { code: String, message: String },
}

impl From<BroadcastNotice> for ServerMessage {
    fn from(notice: BroadcastNotice) -> Self {
        match notice {
            BroadcastNotice::SessionEnded => ServerMessage::SessionEnded,
            BroadcastNotice::Paused => ServerMessage::BroadcastPaused,
            BroadcastNotice::Resumed => ServerMessage::BroadcastResumed,
            BroadcastNotice::Muted => ServerMessage::BroadcastMuted,
            BroadcastNotice::Unmuted => ServerMessage::BroadcastUnmuted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::chunk::PayloadRef;

    #[test]
    fn join_session_uses_action_tag_and_camel_case() {
        let msg = ClientMessage::JoinSession {
            session_id: "golden-eagle-427".to_string(),
            target_language: Some("es".to_string()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"joinSession\""));
        assert!(json.contains("\"sessionId\":\"golden-eagle-427\""));
        assert!(json.contains("\"targetLanguage\":\"es\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn heartbeat_is_a_bare_action() {
        let parsed: ClientMessage = serde_json::from_str(r#"{"action":"heartbeat"}"#).unwrap();
        assert_eq!(parsed, ClientMessage::Heartbeat);
    }

    #[test]
    fn session_joined_matches_the_admission_contract() {
        let msg = ServerMessage::SessionJoined {
            session_id: "golden-eagle-427".to_string(),
            connection_id: "c-1".to_string(),
            role: ConnectionRole::Listener,
            target_language: Some("es".to_string()),
            generation: 1,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"sessionJoined\""));
        assert!(json.contains("\"sessionId\":\"golden-eagle-427\""));
        assert!(json.contains("\"role\":\"listener\""));
        assert!(json.contains("\"targetLanguage\":\"es\""));
    }

    #[test]
    fn audio_data_flattens_the_chunk_fields() {
        let msg = ServerMessage::AudioData {
            chunk: AudioChunk {
                sequence_number: 42,
                timestamp: 1_700_000_000_000,
                duration_ms: 200,
                payload_ref: PayloadRef::inline(&[1, 2, 3]),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"audioData\""));
        assert!(json.contains("\"sequenceNumber\":42"));
        assert!(json.contains("\"durationMs\":200"));
        assert!(json.contains("\"payloadRef\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn notices_map_one_to_one() {
        assert_eq!(
            ServerMessage::from(BroadcastNotice::Paused),
            ServerMessage::BroadcastPaused
        );
        let json = serde_json::to_string(&ServerMessage::BroadcastPaused).unwrap();
        assert_eq!(json, r#"{"type":"broadcastPaused"}"#);
    }
}
