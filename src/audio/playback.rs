//! # Playback Queue
//!
//! Listener-side ordered queue between the network and the audio sink. Holds
//! chunks sorted by sequence number, deduplicates redelivery (expected after a
//! refresh race), prefetches pointer payloads ahead of playback need, and
//! drains strictly in order — buffering, never skipping, when the next
//! expected sequence number has not arrived.
//!
//! ## Ordering:
//! Chunks may arrive through two physical connections at once during a
//! refresh window. The queue orders by sequence number alone, so which socket
//! carried a chunk is invisible to playback.
//!
//! ## Pause/Resume:
//! Pausing stops draining but keeps accepting writes up to capacity; resuming
//! drains the backlog in order before the live tail.

use crate::audio::chunk::{AudioChunk, PayloadRef};
use crate::audio::BufferEvent;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::warn;

/// Resolves a remote payload pointer into audio bytes.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// Fetcher for HTTP(S) payload pointers.
pub struct HttpChunkFetcher {
    client: reqwest::Client,
}

impl HttpChunkFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpChunkFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Playback queue settings.
#[derive(Debug, Clone)]
pub struct PlaybackQueueConfig {
    /// Bound on buffered-but-unplayed chunks; oldest unread are evicted beyond it
    pub capacity_chunks: usize,

    /// Look-ahead window of remote payloads to resolve before playback needs them
    pub prefetch: usize,
}

impl Default for PlaybackQueueConfig {
    fn default() -> Self {
        Self {
            capacity_chunks: 150,
            prefetch: 3,
        }
    }
}

/// Outcome of an `enqueue` call.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// Chunk buffered; `evicted_chunks` oldest entries were dropped to make room
    Accepted { evicted_chunks: usize },

    /// Sequence number already played or already buffered; discarded
    Duplicate,
}

/// A chunk handed to the audio sink, with its payload resolved when the
/// prefetcher (or inline encoding) has made the bytes available.
#[derive(Debug, Clone)]
pub struct ReadyChunk {
    pub chunk: AudioChunk,
    pub payload: Option<Vec<u8>>,
}

struct Buffered {
    chunk: AudioChunk,
    resolved: Option<Vec<u8>>,
}

struct QueueState {
    chunks: BTreeMap<u64, Buffered>,
    /// Next sequence number playback expects; None until the first drain
    next_expected: Option<u64>,
    paused: bool,
    buffering: bool,
}

/// Ordered, deduplicating, prefetching chunk queue.
pub struct PlaybackQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: PlaybackQueueConfig,
    events: Option<UnboundedSender<BufferEvent>>,
}

impl PlaybackQueue {
    pub fn new(config: PlaybackQueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                chunks: BTreeMap::new(),
                next_expected: None,
                paused: false,
                buffering: false,
            }),
            notify: Notify::new(),
            config,
            events: None,
        }
    }

    /// Attach a typed event channel for overflow/buffering reporting.
    pub fn with_events(mut self, events: UnboundedSender<BufferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Buffer one chunk. Idempotent under redelivery: a sequence number that
    /// was already played or is already buffered is discarded.
    pub fn enqueue(&self, chunk: AudioChunk) -> EnqueueOutcome {
        let seq = chunk.sequence_number;
        let mut state = self.state.lock().unwrap();

        if let Some(next) = state.next_expected {
            if seq < next {
                return EnqueueOutcome::Duplicate;
            }
        }
        if state.chunks.contains_key(&seq) {
            return EnqueueOutcome::Duplicate;
        }

        let resolved = chunk.payload_ref.decode_inline();
        state.chunks.insert(seq, Buffered { chunk, resolved });

        // Overflow policy: evict oldest unread, never block the producer
        let mut evicted = 0usize;
        while state.chunks.len() > self.config.capacity_chunks {
            let lowest = state.chunks.keys().next().copied();
            match lowest {
                Some(key) => {
                    state.chunks.remove(&key);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            // Playback resumes from the oldest survivor instead of waiting
            // forever on an evicted sequence number
            let lowest_remaining = state.chunks.keys().next().copied();
            if let (Some(next), Some(lowest)) = (state.next_expected, lowest_remaining) {
                if lowest > next {
                    state.next_expected = Some(lowest);
                }
            }
            if let Some(events) = &self.events {
                let _ = events.send(BufferEvent::PlaybackOverflow {
                    evicted_chunks: evicted,
                });
            }
        }
        drop(state);

        self.notify.notify_one();
        EnqueueOutcome::Accepted {
            evicted_chunks: evicted,
        }
    }

    /// Drain the next in-order chunk, waiting up to `timeout` for it to
    /// arrive. Returns None on timeout (the queue is then in the observable
    /// buffering state) or while paused.
    pub async fn next_ready(&self, timeout: Duration) -> Option<ReadyChunk> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.paused {
                    let target = state
                        .next_expected
                        .or_else(|| state.chunks.keys().next().copied());
                    if let Some(seq) = target {
                        if let Some(buffered) = state.chunks.remove(&seq) {
                            state.next_expected = Some(seq + 1);
                            if state.buffering {
                                state.buffering = false;
                                self.emit_buffering(false);
                            }
                            return Some(ReadyChunk {
                                chunk: buffered.chunk,
                                payload: buffered.resolved,
                            });
                        }
                    }
                    // Next expected chunk absent: buffer, do not skip
                    if !state.buffering {
                        state.buffering = true;
                        self.emit_buffering(true);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    /// Resolve up to the configured look-ahead of remote payload pointers.
    /// Called by the listener loop between drains.
    pub async fn prefetch(&self, fetcher: &dyn ChunkFetcher) {
        let targets: Vec<(u64, String)> = {
            let state = self.state.lock().unwrap();
            let start = state
                .next_expected
                .or_else(|| state.chunks.keys().next().copied())
                .unwrap_or(0);
            state
                .chunks
                .range(start..)
                .take(self.config.prefetch)
                .filter(|(_, buffered)| buffered.resolved.is_none())
                .filter_map(|(&seq, buffered)| match &buffered.chunk.payload_ref {
                    PayloadRef::Remote { url } => Some((seq, url.clone())),
                    PayloadRef::Inline { .. } => None,
                })
                .collect()
        };

        for (seq, url) in targets {
            match fetcher.fetch(&url).await {
                Ok(bytes) => {
                    let mut state = self.state.lock().unwrap();
                    // The chunk may have been evicted or played meanwhile
                    if let Some(buffered) = state.chunks.get_mut(&seq) {
                        buffered.resolved = Some(bytes);
                    }
                    drop(state);
                    self.notify.notify_one();
                }
                Err(err) => {
                    warn!(sequence = seq, url = %url, error = %err, "Chunk prefetch failed");
                }
            }
        }
    }

    /// Stop draining. Writes continue to be accepted up to capacity.
    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
        self.notify.notify_one();
    }

    /// Resume draining; everything accumulated plays in order before the live
    /// tail.
    pub fn resume(&self) {
        self.state.lock().unwrap().paused = false;
        self.notify.notify_one();
    }

    /// Flush-and-reset, used on language change: buffered audio is discarded
    /// and sequence tracking starts over for the new stream.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.chunks.clear();
        state.next_expected = None;
        state.buffering = false;
        drop(state);
        self.notify.notify_one();
    }

    /// Observable "waiting for the next chunk" state for the UI indicator.
    pub fn is_buffering(&self) -> bool {
        self.state.lock().unwrap().buffering
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit_buffering(&self, active: bool) {
        if let Some(events) = &self.events {
            let _ = events.send(BufferEvent::Buffering { active });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(seq: u64) -> AudioChunk {
        AudioChunk::inline(seq, 200, &[seq as u8; 4])
    }

    fn queue() -> PlaybackQueue {
        PlaybackQueue::new(PlaybackQueueConfig {
            capacity_chunks: 150,
            prefetch: 3,
        })
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn drains_strictly_in_order_across_a_connection_switch() {
        let q = queue();

        // Old connection carried 1..=6; the refresh races and the new
        // connection redelivers 5..=6 before continuing with 7..=10.
        for seq in 1..=6 {
            assert!(matches!(q.enqueue(chunk(seq)), EnqueueOutcome::Accepted { .. }));
        }
        assert_eq!(q.enqueue(chunk(5)), EnqueueOutcome::Duplicate);
        assert_eq!(q.enqueue(chunk(6)), EnqueueOutcome::Duplicate);
        for seq in 7..=10 {
            assert!(matches!(q.enqueue(chunk(seq)), EnqueueOutcome::Accepted { .. }));
        }

        // Exactly 1..=10, strictly increasing, no gap, no duplicate
        for expected in 1..=10u64 {
            let ready = q.next_ready(SHORT).await.expect("chunk ready");
            assert_eq!(ready.chunk.sequence_number, expected);
            assert!(ready.payload.is_some());
        }
        assert!(q.next_ready(SHORT).await.is_none());
    }

    #[tokio::test]
    async fn redelivery_of_played_chunks_is_discarded() {
        let q = queue();
        q.enqueue(chunk(1));
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 1);
        assert_eq!(q.enqueue(chunk(1)), EnqueueOutcome::Duplicate);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn buffers_on_gap_instead_of_skipping() {
        let q = queue();
        q.enqueue(chunk(1));
        q.enqueue(chunk(3));

        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 1);

        // 2 is missing: the queue waits, observable as buffering
        assert!(q.next_ready(SHORT).await.is_none());
        assert!(q.is_buffering());

        q.enqueue(chunk(2));
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 2);
        assert!(!q.is_buffering());
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 3);
    }

    #[tokio::test]
    async fn pause_accepts_writes_and_resume_drains_backlog_in_order() {
        let q = queue();
        q.enqueue(chunk(1));
        q.pause();

        assert!(q.next_ready(SHORT).await.is_none());
        for seq in 2..=4 {
            assert!(matches!(q.enqueue(chunk(seq)), EnqueueOutcome::Accepted { .. }));
        }
        assert_eq!(q.len(), 4);

        q.resume();
        for expected in 1..=4u64 {
            assert_eq!(
                q.next_ready(SHORT).await.unwrap().chunk.sequence_number,
                expected
            );
        }
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_unread_and_reports() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let q = PlaybackQueue::new(PlaybackQueueConfig {
            capacity_chunks: 3,
            prefetch: 3,
        })
        .with_events(tx);

        for seq in 1..=5 {
            q.enqueue(chunk(seq));
        }
        assert_eq!(q.len(), 3);

        // Playback resumes from the oldest survivor
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 3);
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 4);
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 5);

        let mut overflow_events = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, BufferEvent::PlaybackOverflow { .. }) {
                overflow_events += 1;
            }
        }
        assert!(overflow_events >= 1);
    }

    #[tokio::test]
    async fn reset_discards_buffered_audio_for_language_change() {
        let q = queue();
        for seq in 1..=3 {
            q.enqueue(chunk(seq));
        }
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 1);

        q.reset();
        assert!(q.is_empty());

        // The new stream restarts numbering; old-stream dedup no longer applies
        assert!(matches!(q.enqueue(chunk(1)), EnqueueOutcome::Accepted { .. }));
        assert_eq!(q.next_ready(SHORT).await.unwrap().chunk.sequence_number, 1);
    }

    #[tokio::test]
    async fn prefetch_resolves_remote_payloads_in_lookahead_window() {
        struct StaticFetcher;

        #[async_trait]
        impl ChunkFetcher for StaticFetcher {
            async fn fetch(&self, url: &str) -> Result<Vec<u8>, TransportError> {
                Ok(url.as_bytes().to_vec())
            }
        }

        let q = queue();
        for seq in 1..=5u64 {
            q.enqueue(AudioChunk {
                sequence_number: seq,
                timestamp: 0,
                duration_ms: 200,
                payload_ref: PayloadRef::Remote {
                    url: format!("https://chunks.example.com/{}", seq),
                },
            });
        }

        q.prefetch(&StaticFetcher).await;

        // Look-ahead of 3: chunks 1..=3 resolved, 4..=5 not yet
        for expected in 1..=3u64 {
            let ready = q.next_ready(SHORT).await.unwrap();
            assert_eq!(ready.chunk.sequence_number, expected);
            assert_eq!(
                ready.payload.as_deref(),
                Some(format!("https://chunks.example.com/{}", expected).as_bytes())
            );
        }
        let ready = q.next_ready(SHORT).await.unwrap();
        assert_eq!(ready.chunk.sequence_number, 4);
        assert!(ready.payload.is_none());
    }
}
