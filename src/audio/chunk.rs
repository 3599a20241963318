//! # Audio Chunks
//!
//! The sequenced unit of translated audio flowing from the server to
//! listeners. Sequence numbers are strictly increasing per
//! (session, target language) stream and survive connection refreshes, which
//! is what lets the PlaybackQueue deduplicate redelivery.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Reference to a chunk's audio bytes: carried inline (base64 on the wire) or
/// as a dereferenceable pointer such as an object-store URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PayloadRef {
    /// Audio bytes carried inline, base64-encoded
    Inline { data: String },

    /// Pointer the listener dereferences ahead of playback need
    Remote { url: String },
}

impl PayloadRef {
    /// Wrap raw audio bytes as an inline payload.
    pub fn inline(bytes: &[u8]) -> Self {
        PayloadRef::Inline {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    /// Decode an inline payload. Returns None for remote payloads or
    /// undecodable data.
    pub fn decode_inline(&self) -> Option<Vec<u8>> {
        match self {
            PayloadRef::Inline { data } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .ok(),
            PayloadRef::Remote { .. } => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, PayloadRef::Remote { .. })
    }
}

/// One unit of translated audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    /// Strictly increasing per (session, target language) stream
    pub sequence_number: u64,

    /// Capture timestamp, epoch milliseconds
    pub timestamp: u64,

    /// Playback duration of this chunk
    pub duration_ms: u32,

    /// Where the audio bytes live
    pub payload_ref: PayloadRef,
}

impl AudioChunk {
    /// Build an inline chunk stamped with the current wall clock.
    pub fn inline(sequence_number: u64, duration_ms: u32, bytes: &[u8]) -> Self {
        Self {
            sequence_number,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
            duration_ms,
            payload_ref: PayloadRef::inline(bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_payload_round_trips() {
        let bytes = vec![0u8, 1, 2, 250, 255];
        let chunk = AudioChunk::inline(7, 200, &bytes);
        assert_eq!(chunk.sequence_number, 7);
        assert_eq!(chunk.payload_ref.decode_inline(), Some(bytes));
    }

    #[test]
    fn payload_ref_wire_format_is_tagged() {
        let remote = PayloadRef::Remote {
            url: "https://chunks.example.com/a/42".to_string(),
        };
        let json = serde_json::to_string(&remote).unwrap();
        assert!(json.contains("\"kind\":\"remote\""));
        assert!(remote.is_remote());
        assert!(remote.decode_inline().is_none());
    }
}
