//! # Broadcast Fan-out
//!
//! Per-session routing table from live connections to their workers' push
//! channels, plus the per (session, language) sequence allocator.
//!
//! ## Ordering:
//! Sequence numbers are allocated here, per stream, independent of which
//! physical connection will carry the chunk. During a refresh window a
//! listener's old and new connections are both registered and both receive
//! the stream; the PlaybackQueue's dedup makes that harmless, and numbering
//! is untouched by the switch.
//!
//! ## Speaker State:
//! Pause/mute gate publishing here; state notices fan out to every
//! participant as one typed enum — a single handler switch on the worker
//! side, no stringly-typed event names.

use crate::audio::chunk::AudioChunk;
use crate::session::model::Connection;
use crate::translator::TranslatedChunk;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

/// Speaker-state notifications fanned out to a session's participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastNotice {
    SessionEnded,
    Paused,
    Resumed,
    Muted,
    Unmuted,
}

/// What a connection worker can receive from the broadcaster.
#[derive(Debug, Clone)]
pub enum ServerPush {
    Audio(AudioChunk),
    Notice(BroadcastNotice),
}

pub type PushHandle = UnboundedSender<ServerPush>;

struct ParticipantEntry {
    push: PushHandle,
    /// Listener's stream selection; None for the speaker
    target_language: Option<String>,
    generation: u64,
}

#[derive(Default)]
struct SessionRoutes {
    participants: HashMap<String, ParticipantEntry>,
    paused: bool,
    muted: bool,
}

/// Routing table + sequence allocator. One instance per process, handed to
/// components by reference.
pub struct Broadcaster {
    sessions: RwLock<HashMap<String, SessionRoutes>>,
    sequences: Mutex<HashMap<(String, String), u64>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection's push channel. Both connections of a refresh
    /// window may be registered at once.
    pub fn register(&self, connection: &Connection, push: PushHandle) {
        let mut sessions = self.sessions.write().unwrap();
        let routes = sessions.entry(connection.session_id.clone()).or_default();
        routes.participants.insert(
            connection.connection_id.clone(),
            ParticipantEntry {
                push,
                target_language: connection.target_language.clone(),
                generation: connection.generation,
            },
        );
        debug!(
            session_id = %connection.session_id,
            connection_id = %connection.connection_id,
            generation = connection.generation,
            "Connection registered for delivery"
        );
    }

    /// Remove one connection from delivery. Idempotent.
    pub fn unregister(&self, session_id: &str, connection_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        let mut drop_session = false;
        if let Some(routes) = sessions.get_mut(session_id) {
            routes.participants.remove(connection_id);
            drop_session = routes.participants.is_empty() && !routes.paused && !routes.muted;
        }
        if drop_session {
            sessions.remove(session_id);
        }
    }

    /// Rewrite a listener's stream selection (language change).
    pub fn update_language(&self, session_id: &str, connection_id: &str, language: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(entry) = sessions
            .get_mut(session_id)
            .and_then(|r| r.participants.get_mut(connection_id))
        {
            entry.target_language = Some(language.to_string());
        }
    }

    /// Distinct languages with at least one listener, the set the Translator
    /// is asked to produce.
    pub fn active_languages(&self, session_id: &str) -> Vec<String> {
        let sessions = self.sessions.read().unwrap();
        let mut languages: Vec<String> = sessions
            .get(session_id)
            .map(|routes| {
                routes
                    .participants
                    .values()
                    .filter_map(|e| e.target_language.clone())
                    .collect::<HashSet<_>>()
                    .into_iter()
                    .collect()
            })
            .unwrap_or_default();
        languages.sort();
        languages
    }

    /// Sequence-stamp the translated chunks and deliver each to the listeners
    /// of its language. Returns the number of deliveries. Publishing is gated
    /// while the broadcast is paused or muted.
    pub fn publish(&self, session_id: &str, chunks: Vec<TranslatedChunk>) -> usize {
        {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(session_id) {
                None => return 0,
                Some(routes) if routes.paused || routes.muted => return 0,
                Some(_) => {}
            }
        }

        let stamped: Vec<AudioChunk> = {
            let mut sequences = self.sequences.lock().unwrap();
            chunks
                .iter()
                .map(|chunk| {
                    let key = (session_id.to_string(), chunk.target_language.clone());
                    let seq = sequences.entry(key).or_insert(0);
                    *seq += 1;
                    AudioChunk::inline(*seq, chunk.duration_ms, &chunk.payload)
                })
                .collect()
        };

        let sessions = self.sessions.read().unwrap();
        let Some(routes) = sessions.get(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (chunk, translated) in stamped.into_iter().zip(chunks.iter()) {
            for entry in routes.participants.values() {
                if entry.target_language.as_deref() == Some(&translated.target_language)
                    && entry.push.send(ServerPush::Audio(chunk.clone())).is_ok()
                {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Fan a speaker-state notice out to every participant and update the
    /// publish gate.
    pub fn notify(&self, session_id: &str, notice: BroadcastNotice) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let Some(routes) = sessions.get_mut(session_id) else {
            return 0;
        };

        match notice {
            BroadcastNotice::Paused => routes.paused = true,
            BroadcastNotice::Resumed => routes.paused = false,
            BroadcastNotice::Muted => routes.muted = true,
            BroadcastNotice::Unmuted => routes.muted = false,
            BroadcastNotice::SessionEnded => {}
        }

        let mut notified = 0;
        for entry in routes.participants.values() {
            if entry.push.send(ServerPush::Notice(notice)).is_ok() {
                notified += 1;
            }
        }

        info!(session_id = %session_id, notice = ?notice, notified, "Broadcast notice");
        notified
    }

    /// Drop a whole session's routes after `sessionEnded` has fanned out.
    pub fn remove_session(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
        self.sequences
            .lock()
            .unwrap()
            .retain(|(sid, _), _| sid != session_id);
    }

    /// Listener counts per language for the session status endpoint.
    pub fn listener_counts(&self, session_id: &str) -> HashMap<String, usize> {
        let sessions = self.sessions.read().unwrap();
        let mut counts = HashMap::new();
        if let Some(routes) = sessions.get(session_id) {
            for entry in routes.participants.values() {
                if let Some(language) = &entry.target_language {
                    *counts.entry(language.clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    /// Total registered connections across sessions.
    pub fn connection_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|r| r.participants.len())
            .sum()
    }

    /// Generation registered for one connection — used to spot a stale
    /// connection that lost a refresh race.
    pub fn generation_of(&self, session_id: &str, connection_id: &str) -> Option<u64> {
        self.sessions
            .read()
            .unwrap()
            .get(session_id)?
            .participants
            .get(connection_id)
            .map(|e| e.generation)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::ConnectionRole;
    use chrono::Duration;
    use tokio::sync::mpsc;

    fn listener(session_id: &str, language: &str) -> Connection {
        Connection::new(
            Connection::assign_id(),
            session_id.to_string(),
            ConnectionRole::Listener,
            Some(language.to_string()),
            Duration::hours(2),
        )
    }

    fn chunk(language: &str) -> TranslatedChunk {
        TranslatedChunk {
            target_language: language.to_string(),
            payload: vec![1, 2, 3, 4],
            duration_ms: 200,
        }
    }

    #[tokio::test]
    async fn chunks_route_by_language_with_per_stream_sequences() {
        let broadcaster = Broadcaster::new();
        let (tx_es, mut rx_es) = mpsc::unbounded_channel();
        let (tx_fr, mut rx_fr) = mpsc::unbounded_channel();

        broadcaster.register(&listener("s", "es"), tx_es);
        broadcaster.register(&listener("s", "fr"), tx_fr);
        assert_eq!(broadcaster.active_languages("s"), vec!["es", "fr"]);

        let delivered = broadcaster.publish("s", vec![chunk("es"), chunk("fr")]);
        assert_eq!(delivered, 2);
        broadcaster.publish("s", vec![chunk("es")]);

        // es stream got 1 then 2; fr stream got its own 1
        match rx_es.recv().await.unwrap() {
            ServerPush::Audio(c) => assert_eq!(c.sequence_number, 1),
            other => panic!("unexpected push: {:?}", other),
        }
        match rx_es.recv().await.unwrap() {
            ServerPush::Audio(c) => assert_eq!(c.sequence_number, 2),
            other => panic!("unexpected push: {:?}", other),
        }
        match rx_fr.recv().await.unwrap() {
            ServerPush::Audio(c) => assert_eq!(c.sequence_number, 1),
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[tokio::test]
    async fn both_connections_of_a_refresh_window_receive_the_stream() {
        let broadcaster = Broadcaster::new();
        let old = listener("s", "es");
        let new = Connection::successor_of(&old, Connection::assign_id(), Duration::hours(2));

        let (tx_old, mut rx_old) = mpsc::unbounded_channel();
        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        broadcaster.register(&old, tx_old);
        broadcaster.register(&new, tx_new);

        let delivered = broadcaster.publish("s", vec![chunk("es")]);
        assert_eq!(delivered, 2);

        // Same sequence number through both paths; the playback queue dedups
        let seq_old = match rx_old.recv().await.unwrap() {
            ServerPush::Audio(c) => c.sequence_number,
            other => panic!("unexpected push: {:?}", other),
        };
        let seq_new = match rx_new.recv().await.unwrap() {
            ServerPush::Audio(c) => c.sequence_number,
            other => panic!("unexpected push: {:?}", other),
        };
        assert_eq!(seq_old, seq_new);

        assert_eq!(broadcaster.generation_of("s", &new.connection_id), Some(2));
    }

    #[tokio::test]
    async fn pause_gates_publishing_and_notices_fan_out() {
        let broadcaster = Broadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.register(&listener("s", "es"), tx);

        assert_eq!(broadcaster.notify("s", BroadcastNotice::Paused), 1);
        assert_eq!(broadcaster.publish("s", vec![chunk("es")]), 0);

        assert_eq!(broadcaster.notify("s", BroadcastNotice::Resumed), 1);
        assert_eq!(broadcaster.publish("s", vec![chunk("es")]), 1);

        match rx.recv().await.unwrap() {
            ServerPush::Notice(BroadcastNotice::Paused) => {}
            other => panic!("unexpected push: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unregister_and_remove_session_stop_delivery() {
        let broadcaster = Broadcaster::new();
        let conn = listener("s", "es");
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.register(&conn, tx);

        broadcaster.unregister("s", &conn.connection_id);
        assert_eq!(broadcaster.publish("s", vec![chunk("es")]), 0);
        assert!(rx.try_recv().is_err());

        broadcaster.remove_session("s");
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[tokio::test]
    async fn listener_counts_group_by_language() {
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broadcaster.register(&listener("s", "es"), tx.clone());
        broadcaster.register(&listener("s", "es"), tx.clone());
        broadcaster.register(&listener("s", "fr"), tx);

        let counts = broadcaster.listener_counts("s");
        assert_eq!(counts.get("es"), Some(&2));
        assert_eq!(counts.get("fr"), Some(&1));
    }
}
