//! # Audio Delivery Pipeline
//!
//! Client-side buffering that keeps audio flowing while the underlying
//! connection is silently swapped out during a refresh.
//!
//! ## Key Components:
//! - **AudioChunk**: one sequenced unit of translated audio
//! - **CaptureBuffer**: speaker-side bounded ring absorbing audio produced
//!   while no connection is writable
//! - **PlaybackQueue**: listener-side ordered, prefetching queue guaranteeing
//!   in-order, gapless playback across a refresh
//!
//! ## Audio Format:
//! - **Sample Rate**: 16kHz
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono
//! - **Encoding**: Little-endian signed integers
//!
//! Buffer incidents are reported on a typed event channel rather than by
//! failing the pipeline: overflow never crashes playback or capture.

pub mod capture;
pub mod chunk;
pub mod playback;

pub use capture::{CaptureBuffer, CaptureBufferConfig, WriteOutcome};
pub use chunk::{AudioChunk, PayloadRef};
pub use playback::{ChunkFetcher, PlaybackQueue, PlaybackQueueConfig, ReadyChunk};

use crate::error::BufferOverflowError;

/// Observable buffer incidents, consumed by metrics and the UI-facing
/// buffering indicator.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferEvent {
    /// The capture ring evicted unread audio to make room
    CaptureOverflow(BufferOverflowError),

    /// The playback queue evicted buffered chunks to make room
    PlaybackOverflow { evicted_chunks: usize },

    /// The playback queue entered or left the buffering state
    Buffering { active: bool },
}
