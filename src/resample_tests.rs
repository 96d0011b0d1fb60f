//! Unit tests for the resample module

#[cfg(test)]
mod tests {
    use crate::error::PipelineError;
    use crate::resample::Resampler;

    fn sine(freq: f32, rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_downsample_output_length() {
        let resampler = Resampler::downsample_48k_to_16k().unwrap();

        assert_eq!(resampler.process(&vec![0.0; 4800]).len(), 1600);
        assert_eq!(resampler.process(&vec![0.0; 960]).len(), 320);
        // round(1001 / 3)
        assert_eq!(resampler.process(&vec![0.0; 1001]).len(), 334);
    }

    #[test]
    fn test_upsample_output_length() {
        let resampler = Resampler::upsample_24k_to_48k().unwrap();

        assert_eq!(resampler.process(&vec![0.0; 2400]).len(), 4800);
        assert_eq!(resampler.process(&vec![0.0; 1]).len(), 2);
        assert_eq!(resampler.output_len(12_345), 24_690);
    }

    #[test]
    fn test_empty_input() {
        let resampler = Resampler::downsample_48k_to_16k().unwrap();
        assert!(resampler.process(&[]).is_empty());
    }

    #[test]
    fn test_constant_signal_keeps_level() {
        let resampler = Resampler::upsample_24k_to_48k().unwrap();
        let output = resampler.process(&vec![0.5; 2400]);

        // Edges may ramp, the middle must not
        for sample in &output[200..4600] {
            assert!((sample - 0.5).abs() < 0.01, "sample {sample}");
        }
    }

    #[test]
    fn test_downsample_preserves_loudness() {
        let resampler = Resampler::downsample_48k_to_16k().unwrap();
        let input = sine(440.0, 48_000, 4800);
        let output = resampler.process(&input);

        let peak = output[100..1500]
            .iter()
            .fold(0.0f32, |peak, s| peak.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.05, "peak {peak}");
    }

    #[test]
    fn test_calls_are_independent() {
        let resampler = Resampler::downsample_48k_to_16k().unwrap();
        let input = sine(300.0, 48_000, 1920);

        let first = resampler.process(&input);
        resampler.process(&vec![1.0; 4800]);
        let second = resampler.process(&input);

        assert_eq!(first, second);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let resampler = Resampler::new(16_000, 16_000).unwrap();
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3]), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_zero_rate_is_unavailable() {
        assert!(matches!(
            Resampler::new(0, 16_000),
            Err(PipelineError::DependencyUnavailable(_))
        ));
    }
}
