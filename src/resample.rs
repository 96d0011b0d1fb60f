//! Fixed-ratio mono resampling between the voice and remote sample rates.

use crate::{
    constants::{REMOTE_INPUT_SAMPLE_RATE, REMOTE_OUTPUT_SAMPLE_RATE, VOICE_SAMPLE_RATE},
    error::PipelineError,
};
use rubato::{FastFixedIn, PolynomialDegree, Resampler as RubatoResampler};
use std::sync::Mutex;

const CHUNK_SIZE: usize = 480;

/// Converts mono float PCM from one fixed rate to another.
///
/// Every call is independent: the underlying filter state is reset before
/// and after processing, so `process` behaves like a pure function. Output
/// length is always `round(input.len() * to_rate / from_rate)` and loudness
/// is preserved (no normalization).
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    inner: Mutex<FastFixedIn<f32>>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, PipelineError> {
        if from_rate == 0 || to_rate == 0 {
            return Err(PipelineError::DependencyUnavailable(format!(
                "cannot resample {from_rate}Hz -> {to_rate}Hz"
            )));
        }

        let inner = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Linear,
            CHUNK_SIZE,
            1, // mono
        )
        .map_err(|e| {
            PipelineError::DependencyUnavailable(format!(
                "resampler {from_rate}Hz -> {to_rate}Hz: {e}"
            ))
        })?;

        Ok(Resampler {
            from_rate,
            to_rate,
            inner: Mutex::new(inner),
        })
    }

    /// Voice capture rate to what the remote service listens at.
    pub fn downsample_48k_to_16k() -> Result<Self, PipelineError> {
        Self::new(VOICE_SAMPLE_RATE, REMOTE_INPUT_SAMPLE_RATE)
    }

    /// Remote speech rate to the voice playback rate.
    pub fn upsample_24k_to_48k() -> Result<Self, PipelineError> {
        Self::new(REMOTE_OUTPUT_SAMPLE_RATE, VOICE_SAMPLE_RATE)
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// Number of output frames produced for `input_len` input frames.
    pub fn output_len(&self, input_len: usize) -> usize {
        (input_len as f64 * self.to_rate as f64 / self.from_rate as f64).round() as usize
    }

    pub fn process(&self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let expected = self.output_len(input.len());
        if self.from_rate == self.to_rate {
            return input.to_vec();
        }

        let mut resampler = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        resampler.reset();

        let delay = resampler.output_delay();
        let wanted = expected + delay;
        let mut output: Vec<f32> = Vec::with_capacity(wanted + CHUNK_SIZE * 2);

        // Feed input in fixed chunks, then silence until the filter delay has
        // been flushed through
        let mut position = 0;
        while output.len() < wanted {
            let needed = resampler.input_frames_next();
            if position > input.len() + needed * 4 {
                warn!("Resampler produced too little output, padding with silence");
                break;
            }

            let mut chunk = vec![0.0f32; needed];
            if position < input.len() {
                let end = (position + needed).min(input.len());
                chunk[..end - position].copy_from_slice(&input[position..end]);
            }
            position += needed;

            let wave_in = vec![chunk];
            match resampler.process(&wave_in, None) {
                Ok(mut resampled) => {
                    if let Some(channel) = resampled.first_mut() {
                        output.append(channel);
                    }
                }
                Err(e) => {
                    warn!("Resampling error: {e}");
                    break;
                }
            }
        }

        resampler.reset();

        output.drain(..delay.min(output.len()));
        output.resize(expected, 0.0);
        output
    }
}
