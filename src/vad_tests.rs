//! Unit tests for the vad module

#[cfg(test)]
mod tests {
    use crate::error::PipelineError;
    use crate::pcm::f32_to_s16le;
    use crate::vad::{level_db, rms, EnergyClassifier, SpeechClassifier, VoiceActivityGate};

    /// Classifier with a fixed answer that counts how often it was asked.
    struct FixedClassifier {
        answer: bool,
        calls: usize,
    }

    impl SpeechClassifier for FixedClassifier {
        fn is_speech(&mut self, _frame: &[i16], _sample_rate: u32) -> bool {
            self.calls += 1;
            self.answer
        }
    }

    fn fixed_gate(answer: bool) -> VoiceActivityGate<FixedClassifier> {
        VoiceActivityGate::with_classifier(FixedClassifier { answer, calls: 0 }, 16_000, 20)
            .unwrap()
    }

    fn tone(amplitude: f32, freq: f32) -> Vec<u8> {
        let samples: Vec<f32> = (0..320)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 16_000.0).sin())
            .collect();
        f32_to_s16le(&samples)
    }

    #[test]
    fn test_frame_size() {
        let gate = VoiceActivityGate::new().unwrap();
        assert_eq!(gate.frame_size(), 640);
        assert_eq!(gate.sample_rate(), 16_000);
    }

    #[test]
    fn test_wrong_frame_size_rejected() {
        let mut gate = VoiceActivityGate::new().unwrap();

        assert_eq!(
            gate.is_speech(&[0u8; 600], None),
            Err(PipelineError::InvalidFrameSize {
                actual: 600,
                expected: 640,
            })
        );
        assert!(gate.is_speech(&[], Some(-40.0)).is_err());
    }

    #[test]
    fn test_quiet_frame_short_circuits_classifier() {
        let mut gate = fixed_gate(true);
        let quiet = tone(0.001, 200.0);

        assert!(!gate.is_speech(&quiet, Some(-40.0)).unwrap());
        assert!(!gate.is_speech(&[0u8; 640], Some(-40.0)).unwrap());
    }

    #[test]
    fn test_loud_frame_defers_to_classifier() {
        let loud = tone(0.5, 200.0);

        let mut yes = fixed_gate(true);
        assert!(yes.is_speech(&loud, Some(-40.0)).unwrap());

        let mut no = fixed_gate(false);
        assert!(!no.is_speech(&loud, Some(-40.0)).unwrap());
    }

    #[test]
    fn test_no_threshold_always_asks_classifier() {
        let mut gate = fixed_gate(true);
        assert!(gate.is_speech(&[0u8; 640], None).unwrap());
        assert!(gate.is_speech(&[0u8; 640], Some(f32::NEG_INFINITY)).unwrap());
    }

    #[test]
    fn test_level_db() {
        assert_eq!(level_db(&[0; 320]), f32::NEG_INFINITY);

        let full_scale = vec![i16::MIN; 320];
        assert!((level_db(&full_scale) - 0.0).abs() < 1e-4);

        let half = vec![16384i16; 320];
        assert!((level_db(&half) + 6.02).abs() < 0.01);
        assert!((rms(&half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_energy_classifier_accepts_tone() {
        let mut gate = VoiceActivityGate::new().unwrap();
        assert!(gate.is_speech(&tone(0.3, 220.0), Some(-45.0)).unwrap());
    }

    #[test]
    fn test_energy_classifier_rejects_hiss() {
        let mut classifier = EnergyClassifier::default();
        let hiss: Vec<i16> = (0..320)
            .map(|i| if i % 2 == 0 { 8000 } else { -8000 })
            .collect();

        assert!(!classifier.is_speech(&hiss, 16_000));
    }

    #[test]
    fn test_energy_classifier_rejects_silence() {
        let mut classifier = EnergyClassifier::default();
        assert!(!classifier.is_speech(&[0; 320], 16_000));
    }
}
