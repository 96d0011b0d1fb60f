//! Multi-speaker mixer.
//!
//! Each speaker gets its own queue of mono chunks. `pop` drains the same
//! window from every speaker, sums them, applies headroom and clips the
//! result to [-1.0, 1.0].

use crate::{
    constants::{VOICE_CHANNELS, VOICE_SAMPLE_RATE},
    error::PipelineError,
};
use std::{collections::HashMap, collections::VecDeque, time::Duration};

/// Opaque key of one captured audio source.
pub type SpeakerId = u64;

#[derive(Clone, Debug)]
pub struct MixerConfig {
    pub sample_rate: u32,
    /// Channel count of interleaved input. Already-mono input is accepted too.
    pub channels: u16,
    pub headroom_db: f32,
    /// Upper bound of buffered frames per speaker
    pub max_buffered_frames: usize,
}

impl Default for MixerConfig {
    fn default() -> Self {
        MixerConfig {
            sample_rate: VOICE_SAMPLE_RATE,
            channels: VOICE_CHANNELS,
            headroom_db: 6.0,
            max_buffered_frames: VOICE_SAMPLE_RATE as usize,
        }
    }
}

#[derive(Default)]
struct SpeakerBuffer {
    chunks: VecDeque<Vec<f32>>,
    buffered: usize,
}

impl SpeakerBuffer {
    fn push(&mut self, chunk: Vec<f32>, capacity: usize) -> usize {
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);

        let mut evicted = 0;
        while self.buffered > capacity {
            match self.chunks.pop_front() {
                Some(oldest) => {
                    self.buffered -= oldest.len();
                    evicted += oldest.len();
                }
                None => break,
            }
        }
        evicted
    }

    /// Add up to `out.len()` frames from the front of the queue into `out`.
    ///
    /// A chunk straddling the end of the window is split and its remainder
    /// stays at the front for the next call.
    fn drain_into(&mut self, out: &mut [f32]) {
        let mut written = 0;

        while written < out.len() {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };

            let take = (out.len() - written).min(front.len());
            for (acc, sample) in out[written..written + take].iter_mut().zip(front.iter()) {
                *acc += sample;
            }
            written += take;

            if take == front.len() {
                self.chunks.pop_front();
            } else {
                front.drain(..take);
            }
        }

        self.buffered -= written;
    }
}

pub struct Mixer {
    sample_rate: u32,
    channels: u16,
    headroom: f32,
    capacity: usize,
    /// Speaker id to index into `buffers`
    slots: HashMap<SpeakerId, usize>,
    buffers: Vec<SpeakerBuffer>,
    /// Slots released by drained speakers, reused before growing `buffers`
    free: Vec<usize>,
}

impl Mixer {
    pub fn new(config: MixerConfig) -> Self {
        Mixer {
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
            headroom: 10f32.powf(-config.headroom_db / 20.0),
            capacity: config.max_buffered_frames,
            slots: HashMap::new(),
            buffers: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Linear gain applied to every mixed frame before clipping.
    pub fn headroom(&self) -> f32 {
        self.headroom
    }

    /// Append interleaved audio for `speaker`, folding it down to mono.
    ///
    /// `channels` must match the configured channel count, or be 1 for input
    /// that is already mono.
    pub fn add(
        &mut self,
        speaker: SpeakerId,
        samples: &[f32],
        channels: u16,
    ) -> Result<(), PipelineError> {
        let valid_layout = channels != 0
            && (channels == self.channels || channels == 1)
            && samples.len() % channels as usize == 0;

        if !valid_layout {
            return Err(PipelineError::InvalidChannelLayout {
                samples: samples.len(),
                channels,
                expected: self.channels,
            });
        }

        if samples.is_empty() {
            return Ok(());
        }

        let mono: Vec<f32> = if channels == 1 {
            samples.to_vec()
        } else {
            samples
                .chunks_exact(channels as usize)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        };

        let slot = match self.slots.get(&speaker) {
            Some(&slot) => slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => {
                        self.buffers[slot] = SpeakerBuffer::default();
                        slot
                    }
                    None => {
                        self.buffers.push(SpeakerBuffer::default());
                        self.buffers.len() - 1
                    }
                };
                self.slots.insert(speaker, slot);
                slot
            }
        };

        let evicted = self.buffers[slot].push(mono, self.capacity);
        if evicted > 0 {
            trace!("Mixer evicted {evicted} frames from a speaker buffer");
        }

        Ok(())
    }

    /// Mix `duration` worth of audio from every speaker.
    ///
    /// Always returns `round(sample_rate * duration)` frames; speakers without
    /// enough buffered audio contribute silence for the missing part.
    pub fn pop(&mut self, duration: Duration) -> Vec<f32> {
        let num_frames = (self.sample_rate as f64 * duration.as_secs_f64()).round() as usize;
        if num_frames == 0 {
            return Vec::new();
        }

        let mut mixed = vec![0.0f32; num_frames];
        for &slot in self.slots.values() {
            self.buffers[slot].drain_into(&mut mixed);
        }

        // Speakers with nothing left give their slot back
        let buffers = &self.buffers;
        let free = &mut self.free;
        self.slots.retain(|_, slot| {
            let keep = buffers[*slot].buffered > 0;
            if !keep {
                free.push(*slot);
            }
            keep
        });

        for sample in &mut mixed {
            *sample = (*sample * self.headroom).clamp(-1.0, 1.0);
        }

        mixed
    }

    /// Frames currently buffered for `speaker`.
    pub fn buffered_frames(&self, speaker: SpeakerId) -> usize {
        self.slots
            .get(&speaker)
            .map(|&slot| self.buffers[slot].buffered)
            .unwrap_or(0)
    }

    /// Speakers holding a slot. A speaker drained by `pop` releases it.
    pub fn speaker_count(&self) -> usize {
        self.slots.len()
    }

    /// True when no speaker has anything buffered.
    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(|b| b.buffered == 0)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.buffers.clear();
        self.free.clear();
    }
}
