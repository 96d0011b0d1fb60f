//! Pull-based playback buffer.
//!
//! The pipeline pushes upsampled speech in, the voice transport pulls fixed
//! size blocks out and gets silence when nothing is queued. Overlapping
//! responses are appended rather than dropped.

use crate::pipeline::PlaybackSink;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Threshold for compacting buffer - when read position exceeds this, we shift data.
/// At 48kHz, 48000 samples = 1 second worth of consumed audio.
const COMPACT_THRESHOLD: usize = 48000;

/// Default upper bound: 30 seconds at 48kHz.
pub const DEFAULT_MAX_BUFFERED: usize = 48000 * 30;

pub struct PlaybackBuffer {
    position: usize,
    buffer: Vec<f32>,
    max_buffered: usize,
    /// Samples handed to the transport since last clear() - for diagnostics
    total_samples_played: usize,
    total_samples_dropped: usize,
}

impl Default for PlaybackBuffer {
    fn default() -> Self {
        Self::with_max_buffered(DEFAULT_MAX_BUFFERED)
    }
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffered(max_buffered: usize) -> Self {
        PlaybackBuffer {
            position: 0,
            buffer: Vec::new(),
            max_buffered,
            total_samples_played: 0,
            total_samples_dropped: 0,
        }
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.buffer.clear();
        self.total_samples_played = 0;
        self.total_samples_dropped = 0;
    }

    /// Compact the buffer by removing already-consumed samples
    fn compact(&mut self) {
        if self.position > 0 {
            self.buffer.drain(..self.position);
            self.position = 0;
        }
    }

    /// Read `count` samples, padding with silence if not enough are queued.
    pub fn pull_samples(&mut self, count: usize) -> Vec<f32> {
        let to_read = count.min(self.buffer_level());

        let mut samples = Vec::with_capacity(count);
        samples.extend_from_slice(&self.buffer[self.position..self.position + to_read]);
        self.position += to_read;
        self.total_samples_played += to_read;

        samples.resize(count, 0.0);

        // Compact periodically to prevent unbounded growth
        if self.position >= COMPACT_THRESHOLD {
            self.compact();
        }

        samples
    }

    /// Queue samples, dropping the oldest queued audio beyond the bound.
    pub fn push_samples(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);

        let overflow = self.buffer_level().saturating_sub(self.max_buffered);
        if overflow > 0 {
            self.position += overflow;
            self.total_samples_dropped += overflow;
            warn!("Playback buffer full, dropped {overflow} samples");
            self.compact();
        }
    }

    pub fn has_data(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Samples queued and not yet played
    pub fn buffer_level(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    pub fn total_samples_played(&self) -> usize {
        self.total_samples_played
    }

    pub fn total_samples_dropped(&self) -> usize {
        self.total_samples_dropped
    }
}

pub type SharedPlaybackBuffer = Arc<Mutex<PlaybackBuffer>>;

pub fn create_buffer() -> SharedPlaybackBuffer {
    Arc::new(Mutex::new(PlaybackBuffer::new()))
}

/// Playback sink that queues into a shared `PlaybackBuffer`.
#[derive(Clone)]
pub struct BufferedSink {
    buffer: SharedPlaybackBuffer,
}

impl BufferedSink {
    pub fn new(buffer: SharedPlaybackBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &SharedPlaybackBuffer {
        &self.buffer
    }
}

#[async_trait]
impl PlaybackSink for BufferedSink {
    async fn play(&self, pcm: Vec<f32>) -> Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_samples(&pcm);
        Ok(())
    }
}
