//! # Capture Buffer
//!
//! Speaker-side circular buffer sitting between the audio source and whichever
//! connection is currently authoritative. Audio produced while no connection
//! is writable (mid-refresh) accumulates here instead of being lost.
//!
//! ## Contract:
//! - `write` never blocks the producer: when the ring is full the oldest
//!   unread samples are evicted and an overflow event is raised
//! - `write` reports a near-capacity flag so callers can apply backpressure
//!   (pause capture) before loss occurs
//! - the buffer does not know which connection drains it, which is what makes
//!   the refresh switch invisible to the capture path
//!
//! ## Thread Safety:
//! At most two workers touch the buffer during a refresh window (the old and
//! new connection pumps); internal state is behind a Mutex.

use crate::audio::BufferEvent;
use crate::error::BufferOverflowError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// Capture ring settings. Capacity is time-based: `capacity_ms` of audio at
/// the configured PCM format.
#[derive(Debug, Clone)]
pub struct CaptureBufferConfig {
    pub sample_rate: u32,
    pub channels: u8,
    /// Total ring capacity in milliseconds of audio
    pub capacity_ms: u32,
    /// Size of one drained frame in milliseconds
    pub frame_duration_ms: u32,
}

impl Default for CaptureBufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            capacity_ms: 30_000,
            frame_duration_ms: 200,
        }
    }
}

impl CaptureBufferConfig {
    fn samples_per_ms(&self) -> usize {
        (self.sample_rate as usize * self.channels as usize) / 1000
    }

    fn max_samples(&self) -> usize {
        self.capacity_ms as usize * self.samples_per_ms()
    }

    fn frame_samples(&self) -> usize {
        self.frame_duration_ms as usize * self.samples_per_ms()
    }
}

/// Result of one `write` call.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Samples appended by this write
    pub accepted_samples: usize,

    /// The ring is at or beyond 90% of capacity; the producer should pause
    /// capture rather than keep writing toward loss
    pub near_capacity: bool,

    /// Present when this write evicted unread audio
    pub overflow: Option<BufferOverflowError>,
}

/// Bounded ring of 16-bit PCM samples with overflow-evict semantics.
pub struct CaptureBuffer {
    samples: Mutex<VecDeque<i16>>,
    config: CaptureBufferConfig,
    max_samples: usize,
    events: Option<UnboundedSender<BufferEvent>>,
}

impl CaptureBuffer {
    pub fn new(config: CaptureBufferConfig) -> Self {
        let max_samples = config.max_samples();
        Self {
            samples: Mutex::new(VecDeque::with_capacity(max_samples)),
            config,
            max_samples,
            events: None,
        }
    }

    /// Attach a typed event channel for overflow reporting.
    pub fn with_events(mut self, events: UnboundedSender<BufferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Append raw 16-bit little-endian PCM bytes.
    ///
    /// Never blocks: on overflow the oldest unread samples are evicted, the
    /// loss is reported, and the write still succeeds.
    pub fn write(&self, data: &[u8]) -> Result<WriteOutcome, String> {
        if data.is_empty() {
            return Err("No audio data provided".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Audio data length must be even for 16-bit samples".to_string());
        }

        let mut cursor = Cursor::new(data);
        let mut incoming = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            incoming.push(sample);
        }

        let accepted = incoming.len();
        let mut evicted = 0usize;

        let mut samples = self.samples.lock().unwrap();
        for sample in incoming {
            samples.push_back(sample);
            if samples.len() > self.max_samples {
                samples.pop_front();
                evicted += 1;
            }
        }
        let near_capacity = samples.len() * 10 >= self.max_samples * 9;
        drop(samples);

        let overflow = if evicted > 0 {
            let err = BufferOverflowError {
                dropped_ms: self.samples_to_ms(evicted),
            };
            if let Some(events) = &self.events {
                let _ = events.send(BufferEvent::CaptureOverflow(err.clone()));
            }
            Some(err)
        } else {
            None
        };

        Ok(WriteOutcome {
            accepted_samples: accepted,
            near_capacity,
            overflow,
        })
    }

    /// Pop up to one frame of the oldest samples, re-encoded as little-endian
    /// bytes for the wire. Returns None when the ring is empty.
    pub fn drain_frame(&self) -> Option<Vec<u8>> {
        let frame_samples = self.config.frame_samples();
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }

        let take = frame_samples.min(samples.len());
        let mut bytes = Vec::with_capacity(take * 2);
        for _ in 0..take {
            let sample = samples.pop_front().unwrap();
            bytes.write_i16::<LittleEndian>(sample).unwrap();
        }
        Some(bytes)
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().unwrap().is_empty()
    }

    /// Milliseconds of audio currently buffered. Bounded by `capacity_ms`.
    pub fn duration_ms(&self) -> u64 {
        self.samples_to_ms(self.len())
    }

    pub fn clear(&self) {
        self.samples.lock().unwrap().clear();
    }

    pub fn config(&self) -> &CaptureBufferConfig {
        &self.config
    }

    fn samples_to_ms(&self, samples: usize) -> u64 {
        let per_ms = self.config.samples_per_ms().max(1);
        (samples / per_ms) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> CaptureBufferConfig {
        // 10ms capacity at 1kHz mono = 10 samples, 2-sample frames
        CaptureBufferConfig {
            sample_rate: 1000,
            channels: 1,
            capacity_ms: 10,
            frame_duration_ms: 2,
        }
    }

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for s in samples {
            bytes.write_i16::<LittleEndian>(*s).unwrap();
        }
        bytes
    }

    #[test]
    fn write_and_drain_preserve_sample_order() {
        let buffer = CaptureBuffer::new(tiny_config());
        let outcome = buffer.write(&pcm_bytes(&[1, 2, 3, 4])).unwrap();
        assert_eq!(outcome.accepted_samples, 4);
        assert!(outcome.overflow.is_none());

        assert_eq!(buffer.drain_frame(), Some(pcm_bytes(&[1, 2])));
        assert_eq!(buffer.drain_frame(), Some(pcm_bytes(&[3, 4])));
        assert_eq!(buffer.drain_frame(), None);
    }

    #[test]
    fn overflow_evicts_oldest_and_never_blocks() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let buffer = CaptureBuffer::new(tiny_config()).with_events(tx);

        let first: Vec<i16> = (0..10).collect();
        buffer.write(&pcm_bytes(&first)).unwrap();

        // Five more samples push the five oldest out
        let outcome = buffer.write(&pcm_bytes(&[100, 101, 102, 103, 104])).unwrap();
        let overflow = outcome.overflow.expect("overflow reported");
        assert_eq!(overflow.dropped_ms, 5);
        assert!(outcome.near_capacity);

        // Reported duration never exceeds the configured capacity
        assert_eq!(buffer.duration_ms(), 10);
        assert_eq!(buffer.len(), 10);

        // Oldest surviving sample is 5
        assert_eq!(buffer.drain_frame(), Some(pcm_bytes(&[5, 6])));

        match rx.try_recv().unwrap() {
            BufferEvent::CaptureOverflow(err) => assert_eq!(err.dropped_ms, 5),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn near_capacity_flags_before_loss() {
        let buffer = CaptureBuffer::new(tiny_config());
        let outcome = buffer.write(&pcm_bytes(&(0..9).collect::<Vec<i16>>())).unwrap();
        assert!(outcome.near_capacity);
        assert!(outcome.overflow.is_none());
    }

    #[test]
    fn odd_length_writes_are_rejected() {
        let buffer = CaptureBuffer::new(tiny_config());
        assert!(buffer.write(&[0u8; 3]).is_err());
        assert!(buffer.write(&[]).is_err());
        assert!(buffer.is_empty());
    }
}
