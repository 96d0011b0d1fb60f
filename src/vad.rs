//! Voice activity gating of fixed-size 16-bit PCM frames.
//!
//! An optional decibel floor is checked first and short-circuits the
//! classifier, so an operator can silence room noise regardless of how
//! sensitive the classifier itself is.

use crate::{
    constants::{REMOTE_INPUT_SAMPLE_RATE, VAD_FRAME_MS},
    error::PipelineError,
};
use byteorder::{ByteOrder, LittleEndian};

/// Decides whether a frame contains speech.
pub trait SpeechClassifier: Send {
    fn is_speech(&mut self, frame: &[i16], sample_rate: u32) -> bool;
}

/// Speech classifier based on short-term energy and zero-crossing rate.
///
/// Speech carries energy with a moderate crossing rate, while broadband
/// noise and hiss cross zero on nearly every other sample.
#[derive(Clone, Debug)]
pub struct EnergyClassifier {
    /// Minimum RMS level (normalized) to consider a frame voiced
    pub min_rms: f32,
    /// Maximum zero crossings per sample
    pub max_zero_crossing_rate: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        EnergyClassifier {
            min_rms: 0.005,
            max_zero_crossing_rate: 0.4,
        }
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn is_speech(&mut self, frame: &[i16], _sample_rate: u32) -> bool {
        if frame.len() < 2 {
            return false;
        }

        let crossings = frame
            .windows(2)
            .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
            .count();
        let zero_crossing_rate = crossings as f32 / (frame.len() - 1) as f32;

        rms(frame) >= self.min_rms && zero_crossing_rate <= self.max_zero_crossing_rate
    }
}

/// Root mean square of a frame, normalized to [0.0, 1.0].
pub fn rms(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = frame
        .iter()
        .map(|&s| {
            let s = s as f64 / 32768.0;
            s * s
        })
        .sum();

    (sum_squares / frame.len() as f64).sqrt() as f32
}

/// Level of a frame in dBFS. Digital silence maps to negative infinity.
pub fn level_db(frame: &[i16]) -> f32 {
    let rms = rms(frame);
    if rms == 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * rms.log10()
    }
}

pub struct VoiceActivityGate<C: SpeechClassifier = EnergyClassifier> {
    classifier: C,
    sample_rate: u32,
    frame_size: usize,
}

impl VoiceActivityGate<EnergyClassifier> {
    /// Gate for 20ms frames at the remote input rate.
    pub fn new() -> Result<Self, PipelineError> {
        Self::with_classifier(
            EnergyClassifier::default(),
            REMOTE_INPUT_SAMPLE_RATE,
            VAD_FRAME_MS,
        )
    }
}

impl<C: SpeechClassifier> VoiceActivityGate<C> {
    pub fn with_classifier(
        classifier: C,
        sample_rate: u32,
        frame_duration_ms: u32,
    ) -> Result<Self, PipelineError> {
        let frame_size = (sample_rate as usize * frame_duration_ms as usize / 1000) * 2;
        if frame_size == 0 {
            return Err(PipelineError::DependencyUnavailable(format!(
                "no voice activity frame fits {frame_duration_ms}ms at {sample_rate}Hz"
            )));
        }

        Ok(VoiceActivityGate {
            classifier,
            sample_rate,
            frame_size,
        })
    }

    /// Exact frame length in bytes every call must match.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Classify one frame of 16-bit little-endian PCM.
    ///
    /// With a finite `threshold_db`, frames quieter than the threshold are
    /// rejected without consulting the classifier.
    pub fn is_speech(
        &mut self,
        frame: &[u8],
        threshold_db: Option<f32>,
    ) -> Result<bool, PipelineError> {
        if frame.len() != self.frame_size {
            return Err(PipelineError::InvalidFrameSize {
                actual: frame.len(),
                expected: self.frame_size,
            });
        }

        let mut samples = vec![0i16; frame.len() / 2];
        LittleEndian::read_i16_into(frame, &mut samples);

        if let Some(threshold_db) = threshold_db.filter(|t| t.is_finite()) {
            if level_db(&samples) < threshold_db {
                return Ok(false);
            }
        }

        Ok(self.classifier.is_speech(&samples, self.sample_rate))
    }
}
